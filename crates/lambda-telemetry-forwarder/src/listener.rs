//! Telemetry listener.
//!
//! Local HTTP endpoint the Telemetry API pushes batches to. Each batch is
//! decoded, every record is enriched and then offered to the writer set.

use crate::config::ListenerConfig;
use crate::record::{Enrichment, decode_batch, enrich};
use crate::writer::WriterSet;
use axum::{Router, body::Bytes, extract::State, http::StatusCode, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// HTTP listener for Telemetry API pushes.
pub struct TelemetryListener {
    config: ListenerConfig,
    writers: WriterSet,
}

impl TelemetryListener {
    /// Creates a listener that forwards to `writers`.
    pub fn new(config: ListenerConfig, writers: WriterSet) -> Self {
        Self { config, writers }
    }

    /// Returns the `host:port` the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Binds the socket and starts serving in the background.
    ///
    /// The returned handle carries the URI to announce to the Telemetry API.
    /// When the configured port is 0 the URI uses the port actually bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be resolved or bound.
    pub async fn start(self) -> std::io::Result<ListenerHandle> {
        let listener = TcpListener::bind(self.bind_address()).await?;
        let local_addr = listener.local_addr()?;
        let uri = format!("http://{}:{}", self.config.host, local_addr.port());

        let app = Router::new()
            .route("/", post(handle_batch))
            .with_state(self.writers);

        let cancel_token = CancellationToken::new();
        let shutdown = cancel_token.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Telemetry listener failed");
                shutdown.cancel();
            }
        });

        tracing::info!(%uri, %local_addr, "Telemetry listener started");

        Ok(ListenerHandle {
            uri,
            local_addr,
            cancel_token,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Handle to a running listener.
#[derive(Clone)]
pub struct ListenerHandle {
    uri: String,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ListenerHandle {
    /// Returns the URI announced to the Telemetry API.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns true once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stops accepting requests and waits up to one second for in-flight
    /// requests to finish. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            tracing::warn!("Telemetry listener did not stop in time, aborting");
            task.abort();
        } else {
            tracing::debug!("Telemetry listener stopped");
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("uri", &self.uri)
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Always answers 200 so the host does not retry a batch.
async fn handle_batch(State(writers): State<WriterSet>, body: Bytes) -> StatusCode {
    let records = match decode_batch(&body) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "Failed to decode telemetry batch");
            return StatusCode::OK;
        }
    };

    tracing::debug!(count = records.len(), "Received telemetry batch");

    let enrichment = Enrichment::from_env();
    for record in records {
        writers.write_all(&enrich(record, &enrichment)).await;
    }

    StatusCode::OK
}
