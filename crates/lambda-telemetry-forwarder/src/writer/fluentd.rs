//! Fluentd forward-protocol writer.
//!
//! Each record is sent as a Message mode entry `[tag, time, record]` encoded
//! as MessagePack. The connection is opened on first use and reused. A failed
//! send drops it; the next record reconnects. Records are not retried.

use super::{Writer, WriterError, tls};
use crate::config::FluentdConfig;
use crate::record::EnrichedRecord;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

type Connection = Box<dyn AsyncWrite + Send + Unpin>;

enum Transport {
    Plain,
    Tls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

/// Forwards records to a Fluentd collector over TCP or TLS.
pub struct FluentdWriter {
    tag: String,
    address: String,
    transport: Transport,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl FluentdWriter {
    /// Creates a writer from its configuration. No connection is opened yet.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::Config`] if no host is set or the host is not a
    /// valid TLS server name, and a TLS error if the client configuration
    /// cannot be built.
    pub fn from_config(config: &FluentdConfig) -> Result<Self, WriterError> {
        let host = config
            .host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| WriterError::Config("fluentd host is required".to_string()))?;

        let transport = if config.tls {
            let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                WriterError::Config(format!("invalid fluentd host '{host}': {e}"))
            })?;
            Transport::Tls {
                connector: tls::connector(config)?,
                server_name,
            }
        } else {
            Transport::Plain
        };

        Ok(Self {
            tag: config.tag_name.clone(),
            address: format!("{host}:{}", config.port),
            transport,
            connect_timeout: config.connect_timeout,
            connection: Mutex::new(None),
        })
    }

    /// Returns the collector address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the tag attached to every record.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self) -> Result<Connection, WriterError> {
        tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| WriterError::ConnectTimeout {
                address: self.address.clone(),
            })?
            .map_err(|source| WriterError::Connect {
                address: self.address.clone(),
                source,
            })
    }

    async fn open(&self) -> io::Result<Connection> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;

        match &self.transport {
            Transport::Plain => Ok(Box::new(stream)),
            Transport::Tls {
                connector,
                server_name,
            } => {
                let stream = connector.connect(server_name.clone(), stream).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[async_trait]
impl Writer for FluentdWriter {
    fn name(&self) -> &str {
        "fluentd"
    }

    async fn write(&self, record: &EnrichedRecord) -> Result<(), WriterError> {
        let entry = encode_entry(&self.tag, unix_time(), record)?;

        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => {
                let connection = self.connect().await?;
                tracing::debug!(address = %self.address, "Connected to fluentd");
                connection
            }
        };

        connection
            .write_all(&entry)
            .await
            .map_err(WriterError::Send)?;
        connection.flush().await.map_err(WriterError::Send)?;

        *slot = Some(connection);
        Ok(())
    }

    async fn flush(&self) -> Result<(), WriterError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_mut() {
            if let Err(e) = connection.flush().await {
                *slot = None;
                return Err(WriterError::Flush(e));
            }
        }
        Ok(())
    }
}

/// Encodes a Message mode entry.
fn encode_entry(tag: &str, time: u64, record: &EnrichedRecord) -> Result<Vec<u8>, WriterError> {
    Ok(rmp_serde::to_vec(&(tag, time, record))?)
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
