//! Process-wide `tracing` subscriber for servers built on the dispatcher.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt;

use msgdispatch_config::{Config, LogFormat};

use crate::observer::OBSERVER_TARGET;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global subscriber on the first call; later calls return a
/// handle without touching global state.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable `log_filter` and
/// [`TelemetryError::Subscriber`] when another subscriber is already global.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

// Dispatcher lifecycle events (listening, stopped, failed) stay visible at
// `info` unless the configured filter mentions their target itself.
fn build_filter(expression: &str) -> Result<EnvFilter, TelemetryError> {
    let filter =
        EnvFilter::try_new(expression).map_err(|error| TelemetryError::Filter(error.to_string()))?;
    if expression.contains(OBSERVER_TARGET) {
        return Ok(filter);
    }
    let lifecycle = format!("{OBSERVER_TARGET}=info")
        .parse::<Directive>()
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;
    Ok(filter.add_directive(lifecycle))
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = build_filter(config.log_filter())?;

    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
