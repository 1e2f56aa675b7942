//! Extensions API client.
//!
//! Registers the extension and long-polls `/event/next` for lifecycle events.
//! See <https://docs.aws.amazon.com/lambda/latest/dg/runtimes-extensions-api.html>.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Header carrying the extension name on registration.
pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
/// Header carrying the extension identifier on every call after registration.
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

const API_VERSION_PATH: &str = "2020-01-01/extension";

/// Identifier issued by the host on registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionId(String);

impl ExtensionId {
    /// Wraps an identifier issued by the host.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as sent in headers.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// A function invocation.
    Invoke,
    /// The execution environment is shutting down.
    Shutdown,
}

/// Why the execution environment is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownReason {
    /// Normal end of the execution environment.
    #[serde(alias = "SPINDOWN")]
    Spindown,
    /// A handler ran out of time.
    #[serde(alias = "TIMEOUT")]
    Timeout,
    /// Any other failure, such as running out of memory.
    #[serde(alias = "FAILURE")]
    Failure,
    /// A reason this extension does not know about.
    #[serde(other)]
    Unknown,
}

/// Tracing header attached to an `INVOKE` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracing {
    /// Header type, e.g. `X-Amzn-Trace-Id`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Header value.
    #[serde(default)]
    pub value: String,
}

/// Response of `GET /event/next`.
///
/// ```json
/// {
///     "eventType": "INVOKE",
///     "deadlineMs": 676051,
///     "requestId": "3da1f2dc-3222-475e-9205-e2e6c6318895",
///     "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:ExtensionTest",
///     "tracing": { "type": "X-Amzn-Trace-Id", "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEvent {
    /// Event type.
    pub event_type: EventType,
    /// Deadline in milliseconds since the epoch. Advisory only.
    #[serde(default)]
    pub deadline_ms: i64,
    /// Request ID of the invocation, empty for `SHUTDOWN`.
    #[serde(default)]
    pub request_id: String,
    /// ARN of the invoked function, empty for `SHUTDOWN`.
    #[serde(default)]
    pub invoked_function_arn: String,
    /// Tracing header of the invocation.
    #[serde(default)]
    pub tracing: Tracing,
    /// Present only on `SHUTDOWN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_reason: Option<ShutdownReason>,
}

impl NextEvent {
    /// Returns true for a `SHUTDOWN` event.
    pub fn is_shutdown(&self) -> bool {
        self.event_type == EventType::Shutdown
    }
}

/// Response body of `POST /register`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    /// Name of the function.
    #[serde(default)]
    pub function_name: String,
    /// Version of the function.
    #[serde(default)]
    pub function_version: String,
    /// Handler the function invokes.
    #[serde(default)]
    pub handler: String,
}

/// Errors from the Extensions API.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ExtensionApiError {
    /// Registration was rejected.
    #[error("failed to register extension, http status: {status}")]
    Registration {
        /// Status returned by the host.
        status: StatusCode,
    },

    /// Registration succeeded without an identifier header.
    #[error("register response is missing the {} header", EXTENSION_ID_HEADER)]
    MissingIdentifier,

    /// The long poll returned a non-200 status.
    #[error("failed to get next event, http status: {status}")]
    NextEvent {
        /// Status returned by the host.
        status: StatusCode,
    },

    /// The request could not be sent or the response could not be read.
    #[error("extensions API request failed")]
    Transport(#[from] reqwest::Error),

    /// A register or next event response body was not valid.
    #[error("failed to decode extensions API response")]
    Decode(#[from] serde_json::Error),
}

/// Client for the Extensions API.
#[derive(Debug, Clone)]
pub struct ExtensionClient {
    base_url: String,
    extension_name: String,
    client: Client,
}

impl ExtensionClient {
    /// Creates a client for the host at `runtime_api_url` (`http://host:port`).
    ///
    /// The underlying HTTP client has no request timeout: `next_event` is a
    /// long poll that stays suspended until the host answers, and dropping
    /// the returned future is the only way to abandon it.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        runtime_api_url: &str,
        extension_name: impl Into<String>,
    ) -> Result<Self, ExtensionApiError> {
        let client = Client::builder().build()?;

        Ok(Self {
            base_url: format!("{}/{}", runtime_api_url.trim_end_matches('/'), API_VERSION_PATH),
            extension_name: extension_name.into(),
            client,
        })
    }

    /// Returns the Extensions API base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the name this extension registers under.
    pub fn extension_name(&self) -> &str {
        &self.extension_name
    }

    /// Registers for `INVOKE` and `SHUTDOWN` events.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionApiError::Registration`] on any non-200 status,
    /// [`ExtensionApiError::Decode`] if the response body is not a valid
    /// register response and [`ExtensionApiError::Transport`] if the host
    /// cannot be reached.
    pub async fn register(&self) -> Result<ExtensionId, ExtensionApiError> {
        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .header(EXTENSION_NAME_HEADER, &self.extension_name)
            .json(&serde_json::json!({
                "events": [EventType::Invoke, EventType::Shutdown]
            }))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ExtensionApiError::Registration { status });
        }

        let id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(ExtensionId::new)
            .ok_or(ExtensionApiError::MissingIdentifier)?;

        let body = response.bytes().await?;
        let function: RegisterResponse = serde_json::from_slice(&body)?;
        tracing::info!(
            function_name = %function.function_name,
            function_version = %function.function_version,
            handler = %function.handler,
            "Register response received"
        );

        Ok(id)
    }

    /// Blocks until the host delivers the next lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionApiError::NextEvent`] on any non-200 status,
    /// [`ExtensionApiError::Decode`] for a malformed body and
    /// [`ExtensionApiError::Transport`] if the connection fails.
    pub async fn next_event(&self, id: &ExtensionId) -> Result<NextEvent, ExtensionApiError> {
        let response = self
            .client
            .get(format!("{}/event/next", self.base_url))
            .header(EXTENSION_ID_HEADER, id.as_str())
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ExtensionApiError::NextEvent { status });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Returns the basename of the running executable.
///
/// Lambda requires the registered name to match the file name under
/// `/opt/extensions`.
pub fn extension_name() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}
