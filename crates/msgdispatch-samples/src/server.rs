//! Serves a handler table until a termination signal arrives.

use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoError;
use thiserror::Error;
use tracing::info;

use msgdispatch::shutdown::{ShutdownError, ShutdownSignal, shutdown_on};
use msgdispatch::telemetry::{self, TelemetryError};
use msgdispatch::{DispatchError, Dispatcher, DispatcherConfig, HandlerRegistry, RegistryError};
use msgdispatch_config::Config;

/// Poll timeout applied when the configuration leaves it unset, so that a
/// signal is noticed without waiting for another client.
pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(250);

const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

/// Errors that stop a sample server.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        #[source]
        source: Arc<OrthoError>,
    },
    /// The handler table was rejected.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Telemetry could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The dispatcher failed to bind or its loop failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// The signal listener could not be installed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Serves `registry` on `config.service_socket` until `signal` fires, then
/// waits for the accept loop to exit.
///
/// # Errors
///
/// Returns the first failure among telemetry setup, binding, signal
/// installation and the accept loop itself.
pub fn serve_until_signalled(
    registry: HandlerRegistry,
    config: &Config,
    signal: &dyn ShutdownSignal,
) -> Result<(), ServeError> {
    telemetry::initialise(config)?;

    let mut dispatcher_config = DispatcherConfig::from_config(config);
    if dispatcher_config.poll_timeout().is_none() {
        dispatcher_config = dispatcher_config.with_poll_timeout(Some(SIGNAL_POLL_INTERVAL));
    }

    let handle = Dispatcher::new(registry, dispatcher_config).spawn(config.service_socket())?;
    let waited = shutdown_on(signal, &handle);
    handle.shutdown();
    handle.join()?;
    waited?;
    info!(target: SERVER_TARGET, "server stopped");
    Ok(())
}
