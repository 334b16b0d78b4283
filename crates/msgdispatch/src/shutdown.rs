//! Termination signals wired to the dispatcher's active flag.

use std::io;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::info;

use crate::dispatcher::DispatcherHandle;

const SHUTDOWN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::shutdown");

/// Abstraction over shutdown notification mechanisms.
pub trait ShutdownSignal: Send + Sync {
    /// Blocks until shutdown should proceed.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] when the listener cannot be installed.
    fn wait(&self) -> Result<(), ShutdownError>;
}

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Waits for SIGTERM, SIGINT, SIGQUIT or SIGHUP.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShutdownSignal;

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<(), ShutdownError> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| ShutdownError::Install { source })?;
        if let Some(signal) = signals.forever().next() {
            info!(target: SHUTDOWN_TARGET, signal, "shutdown signal received");
        }
        Ok(())
    }
}

/// Blocks on `signal`, then clears the dispatcher's active flag.
///
/// # Errors
///
/// Propagates the signal listener failure; the dispatcher keeps running in
/// that case.
pub fn shutdown_on(signal: &dyn ShutdownSignal, handle: &DispatcherHandle) -> Result<(), ShutdownError> {
    signal.wait()?;
    handle.shutdown();
    Ok(())
}
