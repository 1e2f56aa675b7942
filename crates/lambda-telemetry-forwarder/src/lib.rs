//! AWS Lambda extension that forwards Telemetry API records to log collectors.
//!
//! The extension registers with the Extensions API, serves a local endpoint
//! for the Telemetry API to push batches to, enriches every record with
//! function metadata and hands it to the configured writers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod extension;
pub mod listener;
pub mod record;
pub mod runtime;
pub mod telemetry;
pub mod writer;

pub use config::{Config, ConfigBuilder, FluentdConfig, ListenerConfig};
pub use error::{ExtensionError, Result};
pub use extension::{
    EventType, ExtensionApiError, ExtensionClient, ExtensionId, NextEvent, ShutdownReason,
};
pub use listener::{ListenerHandle, TelemetryListener};
pub use record::{DecodeError, EnrichedRecord, Enrichment, RecordBody, TelemetryRecord};
pub use runtime::{ExtensionRuntime, RuntimeBuilder, RuntimeError, ShutdownCause};
pub use telemetry::{
    SubscribeOutcome, TelemetryApiClient, TelemetryApiError, TelemetrySubscription, TelemetryType,
};
pub use writer::{FluentdWriter, Writer, WriterError, WriterSet};
