//! Extension runtime orchestrator.
//!
//! Boot order is fixed:
//! 1. Build the writer set (at least one writer is required)
//! 2. Install termination signal handlers
//! 3. Register with the Extensions API
//! 4. Start the telemetry listener
//! 5. Subscribe the listener to the Telemetry API
//!
//! The runtime then long-polls for lifecycle events until `SHUTDOWN`, a
//! termination signal, cancellation or a failed poll ends the loop. Writers
//! are flushed before the listener is stopped.

use crate::config::Config;
use crate::extension::{ExtensionApiError, ExtensionClient, ExtensionId, ShutdownReason};
use crate::listener::TelemetryListener;
use crate::telemetry::{
    SubscribeOutcome, TelemetryApiClient, TelemetryApiError, parse_subscribe_events,
};
use crate::writer::{WriterError, WriterSet};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Why the event loop ended.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The host sent `SHUTDOWN`. Writers were flushed.
    Shutdown(Option<ShutdownReason>),
    /// A termination signal arrived. Writers were flushed.
    Signal,
    /// The cancellation token was triggered by the owner of the runtime.
    Cancelled,
    /// Polling for the next event failed. The host is assumed to be tearing
    /// the environment down.
    NextEventFailed,
}

/// Extension runtime that orchestrates all components.
pub struct ExtensionRuntime {
    config: Config,
    extension_name: String,
    cancel_token: CancellationToken,
}

impl ExtensionRuntime {
    /// Creates a runtime registering under the executable's file name.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            extension_name: crate::extension::extension_name(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Overrides the name sent on registration.
    pub fn with_extension_name(mut self, name: impl Into<String>) -> Self {
        self.extension_name = name.into();
        self
    }

    /// Returns a handle to the cancellation token.
    ///
    /// The token is cancelled when the runtime finishes. Cancelling it
    /// externally ends the event loop without flushing.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs the extension until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if no writer is configured, a writer cannot be
    /// built, signal handlers cannot be installed or any boot step fails.
    pub async fn run(self) -> Result<ShutdownCause, RuntimeError> {
        let writers = WriterSet::from_config(&self.config)?;
        if writers.is_empty() {
            return Err(RuntimeError::NoWritersConfigured);
        }

        let termination = termination_signal().map_err(RuntimeError::Signal)?;
        self.run_with_writers(writers, termination).await
    }

    /// Runs the extension with an explicit writer set and termination future.
    ///
    /// `termination` resolving has the same effect as a termination signal.
    ///
    /// # Errors
    ///
    /// Returns an error if `writers` is empty or any boot step fails.
    /// Failures after boot end the loop and are reported through
    /// [`ShutdownCause`].
    pub async fn run_with_writers<F>(
        self,
        writers: WriterSet,
        termination: F,
    ) -> Result<ShutdownCause, RuntimeError>
    where
        F: Future<Output = ()> + Send,
    {
        if writers.is_empty() {
            return Err(RuntimeError::NoWritersConfigured);
        }

        let runtime_api = self.config.runtime_api_url();
        let extensions = ExtensionClient::new(&runtime_api, self.extension_name.as_str())?;
        let telemetry = TelemetryApiClient::new(
            &runtime_api,
            parse_subscribe_events(&self.config.subscribe_events),
        )?;

        let id = extensions.register().await?;
        tracing::info!(
            extension_name = %self.extension_name,
            extension_id = %id,
            "Extension registered"
        );

        let listener = TelemetryListener::new(self.config.listener.clone(), writers.clone())
            .start()
            .await
            .map_err(RuntimeError::ListenerStart)?;

        tracing::info!(
            uri = %listener.uri(),
            types = ?telemetry.types(),
            "Subscribing to telemetry API"
        );
        match telemetry.subscribe(&id, listener.uri()).await {
            Ok(SubscribeOutcome::Subscribed(response)) => {
                tracing::info!(%response, "Subscribed to telemetry API")
            }
            Ok(SubscribeOutcome::Unsupported) => {}
            Err(e) => {
                listener.shutdown().await;
                return Err(e.into());
            }
        }

        let cause = self
            .event_loop(&extensions, &id, &writers, termination)
            .await;
        tracing::info!(?cause, "Event loop finished");

        listener.shutdown().await;
        self.cancel_token.cancel();

        Ok(cause)
    }

    async fn event_loop<F>(
        &self,
        extensions: &ExtensionClient,
        id: &ExtensionId,
        writers: &WriterSet,
        termination: F,
    ) -> ShutdownCause
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(termination);

        loop {
            tracing::debug!("Waiting for next event");

            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    tracing::info!("Runtime cancelled");
                    return ShutdownCause::Cancelled;
                }

                _ = &mut termination => {
                    tracing::info!("Received termination signal");
                    writers.flush_all().await;
                    self.cancel_token.cancel();
                    return ShutdownCause::Signal;
                }

                event = extensions.next_event(id) => match event {
                    Ok(event) if event.is_shutdown() => {
                        tracing::info!(reason = ?event.shutdown_reason, "Received shutdown event");
                        writers.flush_all().await;
                        return ShutdownCause::Shutdown(event.shutdown_reason);
                    }
                    Ok(event) => {
                        tracing::debug!(request_id = %event.request_id, "Received invoke event");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to get next event");
                        return ShutdownCause::NextEventFailed;
                    }
                },
            }
        }
    }
}

/// Resolves on the first SIGINT, SIGTERM or SIGQUIT.
///
/// Handlers are installed immediately, so a signal arriving before the
/// future is polled is not lost.
#[cfg(unix)]
fn termination_signal() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        };
        tracing::debug!(signal = name, "Signal caught");
    })
}

#[cfg(not(unix))]
fn termination_signal() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
}

/// Errors from the extension runtime.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No downstream writer is enabled.
    #[error("no writers configured")]
    NoWritersConfigured,

    /// A writer could not be built.
    #[error("failed to create writer")]
    Writer(#[from] WriterError),

    /// Termination signal handlers could not be installed.
    #[error("failed to install signal handlers")]
    Signal(#[source] std::io::Error),

    /// Registration or the Extensions API client failed.
    #[error(transparent)]
    ExtensionApi(#[from] ExtensionApiError),

    /// The telemetry listener could not be started.
    #[error("failed to start telemetry listener")]
    ListenerStart(#[source] std::io::Error),

    /// Subscription or the Telemetry API client failed.
    #[error(transparent)]
    TelemetryApi(#[from] TelemetryApiError),
}

/// Builder for configuring the extension runtime.
#[must_use = "builders do nothing unless .build() is called"]
pub struct RuntimeBuilder {
    config: Config,
    extension_name: Option<String>,
}

impl RuntimeBuilder {
    /// Creates a new runtime builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            extension_name: None,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the host API authority.
    pub fn runtime_api(mut self, runtime_api: impl Into<String>) -> Self {
        self.config.runtime_api = runtime_api.into();
        self
    }

    /// Sets the name sent on registration.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.extension_name = Some(name.into());
        self
    }

    /// Builds the extension runtime.
    pub fn build(self) -> ExtensionRuntime {
        let runtime = ExtensionRuntime::new(self.config);
        match self.extension_name {
            Some(name) => runtime.with_extension_name(name),
            None => runtime,
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
