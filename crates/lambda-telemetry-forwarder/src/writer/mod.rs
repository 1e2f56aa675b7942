//! Downstream writers.
//!
//! A [`Writer`] accepts enriched records and owns its connection to a sink.
//! The [`WriterSet`] is built once at boot and shared read-only by the
//! listener and the runtime.

mod fluentd;
mod tls;

pub use fluentd::FluentdWriter;

use crate::config::Config;
use crate::record::EnrichedRecord;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors from downstream writers.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// The writer is misconfigured.
    #[error("invalid writer configuration: {0}")]
    Config(String),

    /// The sink refused the connection.
    #[error("failed to connect to {address}")]
    Connect {
        /// Sink address.
        address: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Connecting (including any TLS handshake) took too long.
    #[error("timed out connecting to {address}")]
    ConnectTimeout {
        /// Sink address.
        address: String,
    },

    /// The record could not be encoded.
    #[error("failed to encode record")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Sending the record failed. The connection has been dropped.
    #[error("failed to send record")]
    Send(#[source] std::io::Error),

    /// Flushing the connection failed.
    #[error("failed to flush writer")]
    Flush(#[source] std::io::Error),

    /// TLS client configuration could not be built.
    #[error("failed to configure TLS")]
    Tls(#[from] rustls::Error),

    /// The CA bundle could not be loaded.
    #[error("failed to load CA certificates from {}", path.display())]
    CaFile {
        /// Path of the bundle.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A sink for enriched records.
///
/// `write` may be called concurrently from several listener requests.
/// `flush` is called once, from the runtime, after the event loop ends.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Forwards one record.
    async fn write(&self, record: &EnrichedRecord) -> Result<(), WriterError>;

    /// Pushes out anything buffered.
    async fn flush(&self) -> Result<(), WriterError>;
}

/// The writers configured at boot, in registration order.
#[derive(Clone, Default)]
pub struct WriterSet {
    writers: Arc<[Arc<dyn Writer>]>,
}

impl WriterSet {
    /// Creates a set from writers in the order they should see records.
    pub fn new(writers: Vec<Arc<dyn Writer>>) -> Self {
        Self {
            writers: writers.into(),
        }
    }

    /// Builds the writers enabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if an enabled writer is misconfigured.
    pub fn from_config(config: &Config) -> Result<Self, WriterError> {
        let mut writers: Vec<Arc<dyn Writer>> = Vec::new();

        if config.fluentd.enabled {
            let writer = FluentdWriter::from_config(&config.fluentd)?;
            tracing::info!(
                address = %writer.address(),
                tag = %writer.tag(),
                "Fluentd writer enabled"
            );
            writers.push(Arc::new(writer));
        }

        Ok(Self::new(writers))
    }

    /// Returns the number of writers.
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    /// Returns true if no writer is configured.
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Offers `record` to every writer in order. Failures are logged and do
    /// not stop later writers.
    pub async fn write_all(&self, record: &EnrichedRecord) {
        for writer in self.writers.iter() {
            if let Err(e) = writer.write(record).await {
                tracing::warn!(writer = writer.name(), error = %e, "Failed to write record");
            }
        }
    }

    /// Flushes every writer in order. Failures are logged.
    pub async fn flush_all(&self) {
        for writer in self.writers.iter() {
            match writer.flush().await {
                Ok(()) => tracing::debug!(writer = writer.name(), "Writer flushed"),
                Err(e) => {
                    tracing::error!(writer = writer.name(), error = %e, "Failed to flush writer")
                }
            }
        }
    }
}

impl fmt::Debug for WriterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.writers.iter().map(|w| w.name()))
            .finish()
    }
}
