//! Shared configuration for the message dispatch server and its clients.
//!
//! Values are layered by [`ortho_config`]: built-in defaults, an optional
//! `msgdispatch.toml`, `MSGDISPATCH_*` environment variables and finally
//! command-line flags. The resolved [`Config`] is consumed by the dispatcher
//! (concurrency cap, poll timeout, worker stack size, accept failure policy)
//! and by the telemetry bootstrap (log filter and format).

mod defaults;
mod endpoint;
mod logging;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_MAX_CONCURRENCY, default_log_filter, default_log_filter_string,
    default_log_format, default_max_concurrency, default_service_endpoint,
};
pub use endpoint::{EndpointParseError, EndpointPreparationError, ServiceEndpoint};
pub use logging::{LogFormat, LogFormatParseError};

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "MSGDISPATCH")]
pub struct Config {
    /// Local socket the server listens on and clients dial.
    #[serde(default = "defaults::default_service_endpoint")]
    pub service_socket: ServiceEndpoint,
    /// Maximum number of handlers running at once. Zero selects the default.
    #[serde(default = "defaults::default_max_concurrency")]
    pub max_concurrency: usize,
    /// Milliseconds the accept loop waits for a connection before re-checking
    /// whether it should keep running. Zero waits forever.
    #[serde(default)]
    pub poll_timeout_ms: u64,
    /// Stack size in bytes for worker threads. Zero keeps the platform default.
    #[serde(default)]
    pub worker_stack_size: usize,
    /// Accept failures are fatal when zero; otherwise every Nth failure is
    /// logged and the loop keeps accepting.
    #[serde(default)]
    pub accept_failure_log_every: u32,
    /// `tracing` filter expression.
    #[serde(default = "defaults::default_log_filter_string")]
    pub log_filter: String,
    /// Output format for log lines.
    #[serde(default = "defaults::default_log_format")]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_socket: default_service_endpoint(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_timeout_ms: 0,
            worker_stack_size: 0,
            accept_failure_log_every: 0,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Socket endpoint shared by the server and its clients.
    #[must_use]
    pub fn service_socket(&self) -> &ServiceEndpoint {
        &self.service_socket
    }

    /// Concurrency cap with the zero-means-default rule applied.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            self.max_concurrency
        }
    }

    /// Poll timeout for the accept loop, if one is configured.
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Duration> {
        (self.poll_timeout_ms > 0).then(|| Duration::from_millis(self.poll_timeout_ms))
    }

    /// Requested worker thread stack size, if any.
    #[must_use]
    pub fn worker_stack_size(&self) -> Option<usize> {
        (self.worker_stack_size > 0).then_some(self.worker_stack_size)
    }

    /// Interval for logging accept failures, or `None` when they are fatal.
    #[must_use]
    pub fn accept_failure_log_every(&self) -> Option<u32> {
        (self.accept_failure_log_every > 0).then_some(self.accept_failure_log_every)
    }

    /// Filter expression handed to the log subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Selected log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_concurrency_selects_default() {
        let config = Config {
            max_concurrency: 0,
            ..Config::default()
        };
        assert_eq!(config.max_concurrency(), DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn zero_poll_timeout_means_wait_forever() {
        let mut config = Config::default();
        assert_eq!(config.poll_timeout(), None);
        config.poll_timeout_ms = 250;
        assert_eq!(config.poll_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn accept_failures_are_fatal_by_default() {
        assert_eq!(Config::default().accept_failure_log_every(), None);
    }
}
