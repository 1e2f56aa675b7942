//! AWS Lambda telemetry forwarder extension binary.
//!
//! # Configuration
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `/var/task/telemetry-extension.toml`
//! 3. Lambda environment variables
//! 4. Environment variables with `TELEMETRY_EXTENSION_` prefix
//!
//! The extension does nothing unless `TELEMETRY_EXTENSION_ENABLED=true`.
//! Diagnostics are written to stderr as JSON, filtered by
//! `TELEMETRY_EXTENSION_LOG_LEVEL` (default `info`).

use anyhow::{Context, Result};
use lambda_telemetry_forwarder::{Config, ExtensionRuntime};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_LEVEL_ENV: &str = "TELEMETRY_EXTENSION_LOG_LEVEL";

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = format!("{e:#}");
            tracing::error!(error = %error, "Telemetry extension failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    if !Config::is_enabled().context("failed to read enable flag")? {
        tracing::info!("Telemetry extension is not enabled");
        return Ok(());
    }

    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    let cause = ExtensionRuntime::new(config)
        .run()
        .await
        .context("extension runtime failed")?;
    tracing::info!(?cause, "Telemetry extension stopped");

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(())
}
