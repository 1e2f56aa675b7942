//! Telemetry API client.
//!
//! This module provides the subscription model and the client that subscribes
//! the telemetry listener to the Lambda Telemetry API.
//! See <https://docs.aws.amazon.com/lambda/latest/dg/telemetry-api.html>.

use crate::extension::{EXTENSION_ID_HEADER, ExtensionId};
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};

/// Telemetry API schema version this extension speaks.
pub const SCHEMA_VERSION: &str = "2022-07-01";

/// Types of telemetry events from the Telemetry API.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryType {
    /// Platform events (start, end, report, fault, extension).
    Platform,
    /// Function logs from stdout/stderr.
    Function,
    /// Extension logs.
    Extension,
}

impl TelemetryType {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "platform" => Some(Self::Platform),
            "function" => Some(Self::Function),
            "extension" => Some(Self::Extension),
            _ => None,
        }
    }
}

/// Parses a comma-separated list of event types.
///
/// Tokens are matched ignoring case and surrounding whitespace. Unknown tokens
/// are logged and skipped. An empty result falls back to `function`.
pub fn parse_subscribe_events(raw: &str) -> Vec<TelemetryType> {
    let mut types = Vec::new();

    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match TelemetryType::parse(token) {
            Some(kind) if !types.contains(&kind) => types.push(kind),
            Some(_) => {}
            None => tracing::warn!(token, "Invalid subscribe type"),
        }
    }

    if types.is_empty() {
        types.push(TelemetryType::Function);
    }

    types
}

/// Buffering configuration for Telemetry API subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum number of events to buffer before sending.
    pub max_items: u32,
    /// Maximum size in bytes to buffer before sending.
    pub max_bytes: u32,
    /// Maximum time in milliseconds to buffer before sending.
    pub timeout_ms: u32,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_bytes: 256 * 1024,
            timeout_ms: 1000,
        }
    }
}

/// Destination configuration for Telemetry API subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Protocol to use (HTTP only supported).
    pub protocol: String,
    /// URI to send events to.
    #[serde(rename = "URI")]
    pub uri: String,
    /// HTTP method the host pushes with.
    pub method: String,
    /// Body encoding of pushed batches.
    pub encoding: String,
}

impl DestinationConfig {
    /// HTTP POST of JSON batches to `uri`.
    pub fn http(uri: impl Into<String>) -> Self {
        Self {
            protocol: "HTTP".to_string(),
            uri: uri.into(),
            method: "POST".to_string(),
            encoding: "JSON".to_string(),
        }
    }
}

/// Subscription request for the Telemetry API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySubscription {
    /// Schema version.
    pub schema_version: String,
    /// Types of telemetry to subscribe to.
    pub types: Vec<TelemetryType>,
    /// Buffering configuration.
    pub buffering: BufferingConfig,
    /// Destination for events.
    pub destination: DestinationConfig,
}

impl TelemetrySubscription {
    /// Creates a subscription delivering `types` to `listener_uri`.
    pub fn new(types: Vec<TelemetryType>, listener_uri: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            types,
            buffering: BufferingConfig::default(),
            destination: DestinationConfig::http(listener_uri),
        }
    }
}

/// Outcome of a subscribe call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// HTTP 200, carrying the response body.
    Subscribed(String),
    /// HTTP 202: the host accepted the call but has no Telemetry API, which
    /// happens in local sandboxes. Not treated as an error.
    Unsupported,
}

/// Errors from the Telemetry API.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TelemetryApiError {
    /// The host rejected the subscription.
    #[error("failed to subscribe to telemetry API '{url}': {status} {body}")]
    Subscribe {
        /// Telemetry API URL.
        url: String,
        /// Status returned by the host.
        status: StatusCode,
        /// Response body, empty if it could not be read.
        body: String,
    },

    /// The request could not be sent or the response could not be read.
    #[error("telemetry API request failed")]
    Transport(#[from] reqwest::Error),
}

/// Client for the Telemetry API.
#[derive(Debug, Clone)]
pub struct TelemetryApiClient {
    base_url: String,
    types: Vec<TelemetryType>,
    client: Client,
}

impl TelemetryApiClient {
    /// Creates a client for the host at `runtime_api_url` (`http://host:port`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        runtime_api_url: &str,
        types: Vec<TelemetryType>,
    ) -> Result<Self, TelemetryApiError> {
        Ok(Self {
            base_url: format!(
                "{}/{}/telemetry",
                runtime_api_url.trim_end_matches('/'),
                SCHEMA_VERSION
            ),
            types,
            client: Client::builder().build()?,
        })
    }

    /// Returns the Telemetry API URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the event types this client subscribes to.
    pub fn types(&self) -> &[TelemetryType] {
        &self.types
    }

    /// Subscribes `listener_uri` to the configured event types.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryApiError::Subscribe`] for any status other than 200
    /// or 202, and [`TelemetryApiError::Transport`] if the host cannot be
    /// reached.
    pub async fn subscribe(
        &self,
        id: &ExtensionId,
        listener_uri: &str,
    ) -> Result<SubscribeOutcome, TelemetryApiError> {
        let subscription = TelemetrySubscription::new(self.types.clone(), listener_uri);

        let response = self
            .client
            .put(&self.base_url)
            .header(CONTENT_TYPE, "application/json")
            .header(EXTENSION_ID_HEADER, id.as_str())
            .json(&subscription)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(SubscribeOutcome::Subscribed(response.text().await?)),
            StatusCode::ACCEPTED => {
                tracing::error!(
                    "Subscription failed. Telemetry API is not supported! Is this extension running in a local sandbox?"
                );
                Ok(SubscribeOutcome::Unsupported)
            }
            status => {
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::debug!(error = %e, "Failed to read subscribe error body");
                        String::new()
                    }
                };
                Err(TelemetryApiError::Subscribe {
                    url: self.base_url.clone(),
                    status,
                    body,
                })
            }
        }
    }
}
