//! Structured reporting of dispatcher lifecycle events.

use std::fmt;
use std::sync::Arc;

use msgdispatch_config::ServiceEndpoint;

use crate::errors::{ConnectionError, DispatchError, HandlerError};
use crate::protocol::TypeCode;

pub(crate) const OBSERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatcher");

/// Why a handler did not complete normally.
#[derive(Debug)]
pub enum HandlerFailure {
    /// The handler returned an error.
    Error(HandlerError),
    /// The handler panicked; the payload message when it was a string.
    Panic(String),
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(error) => write!(formatter, "{error}"),
            Self::Panic(message) => write!(formatter, "handler panicked: {message}"),
        }
    }
}

/// Observer trait used to surface dispatcher events to telemetry sinks.
///
/// Every method has an empty default so that tests can listen for the one
/// event they care about.
pub trait DispatchObserver: Send + Sync {
    /// Invoked once the listening socket is bound.
    fn listening(&self, _endpoint: &ServiceEndpoint, _capacity: usize) {}

    /// Invoked when a connection has been admitted and its worker spawned.
    fn admitted(&self, _type_code: TypeCode) {}

    /// Invoked when a connection names a type code with no handler.
    fn unknown_type(&self, _type_code: TypeCode) {}

    /// Invoked when a client goes away before its type code is complete.
    fn client_aborted(&self, _error: &ConnectionError) {}

    /// Invoked when `accept` fails and the policy keeps the loop running.
    fn accept_failed(&self, _error: &std::io::Error, _failures: u64) {}

    /// Invoked when a handler returns an error or panics.
    fn handler_failed(&self, _type_code: TypeCode, _failure: &HandlerFailure) {}

    /// Invoked after a worker has closed its connection and released its slot.
    fn worker_finished(&self, _type_code: TypeCode) {}

    /// Invoked when the accept loop exits after a shutdown request.
    fn stopped(&self, _endpoint: &ServiceEndpoint) {}

    /// Invoked when the accept loop terminates with an error.
    fn failed(&self, _error: &DispatchError) {}
}

impl<T> DispatchObserver for Arc<T>
where
    T: DispatchObserver + ?Sized,
{
    fn listening(&self, endpoint: &ServiceEndpoint, capacity: usize) {
        (**self).listening(endpoint, capacity);
    }

    fn admitted(&self, type_code: TypeCode) {
        (**self).admitted(type_code);
    }

    fn unknown_type(&self, type_code: TypeCode) {
        (**self).unknown_type(type_code);
    }

    fn client_aborted(&self, error: &ConnectionError) {
        (**self).client_aborted(error);
    }

    fn accept_failed(&self, error: &std::io::Error, failures: u64) {
        (**self).accept_failed(error, failures);
    }

    fn handler_failed(&self, type_code: TypeCode, failure: &HandlerFailure) {
        (**self).handler_failed(type_code, failure);
    }

    fn worker_finished(&self, type_code: TypeCode) {
        (**self).worker_finished(type_code);
    }

    fn stopped(&self, endpoint: &ServiceEndpoint) {
        (**self).stopped(endpoint);
    }

    fn failed(&self, error: &DispatchError) {
        (**self).failed(error);
    }
}

/// Default observer that records events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredObserver;

impl StructuredObserver {
    /// Builds a new observer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DispatchObserver for StructuredObserver {
    fn listening(&self, endpoint: &ServiceEndpoint, capacity: usize) {
        tracing::info!(
            target: OBSERVER_TARGET,
            event = "listening",
            endpoint = %endpoint,
            capacity,
            "dispatcher listening"
        );
    }

    fn admitted(&self, type_code: TypeCode) {
        tracing::debug!(
            target: OBSERVER_TARGET,
            event = "admitted",
            type_code,
            "connection admitted"
        );
    }

    fn unknown_type(&self, type_code: TypeCode) {
        tracing::warn!(
            target: OBSERVER_TARGET,
            event = "unknown_type",
            type_code,
            "no handler registered for type code"
        );
    }

    fn client_aborted(&self, error: &ConnectionError) {
        tracing::debug!(
            target: OBSERVER_TARGET,
            event = "client_aborted",
            error = %error,
            "client closed before sending a type code"
        );
    }

    fn accept_failed(&self, error: &std::io::Error, failures: u64) {
        tracing::warn!(
            target: OBSERVER_TARGET,
            event = "accept_failed",
            error = %error,
            failures,
            "failed to accept connection"
        );
    }

    fn handler_failed(&self, type_code: TypeCode, failure: &HandlerFailure) {
        tracing::error!(
            target: OBSERVER_TARGET,
            event = "handler_failed",
            type_code,
            error = %failure,
            "handler failed"
        );
    }

    fn worker_finished(&self, type_code: TypeCode) {
        tracing::trace!(
            target: OBSERVER_TARGET,
            event = "worker_finished",
            type_code,
            "worker finished"
        );
    }

    fn stopped(&self, endpoint: &ServiceEndpoint) {
        tracing::info!(
            target: OBSERVER_TARGET,
            event = "stopped",
            endpoint = %endpoint,
            "dispatcher stopped"
        );
    }

    fn failed(&self, error: &DispatchError) {
        tracing::error!(
            target: OBSERVER_TARGET,
            event = "failed",
            error = %error,
            error_debug = ?error,
            "dispatcher terminated"
        );
    }
}
