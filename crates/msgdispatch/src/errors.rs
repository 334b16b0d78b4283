//! Error types for connections, listeners, handlers and the accept loop.
//!
//! The split mirrors the failure-isolation contract: [`ConnectionError`] and
//! [`HandlerError`] stay local to one exchange, while [`DispatchError`] is the
//! only error that terminates a running server.

use std::io;

use thiserror::Error;

use msgdispatch_config::EndpointPreparationError;

use crate::protocol::TypeCode;

/// Errors raised by operations on a single [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was already closed.
    #[error("operation on closed connection")]
    Closed,
    /// The peer closed the stream before the requested field was complete.
    #[error("peer closed the connection before the field was complete")]
    EndOfStream,
    /// A caller-supplied argument was rejected before touching the socket.
    #[error("invalid connection argument: {message}")]
    InvalidArgument { message: String },
    /// Dialling the service failed.
    #[error("failed to connect to {service}: {source}")]
    Connect {
        service: String,
        #[source]
        source: io::Error,
    },
    /// The peer sent bytes that do not fit the field being read.
    #[error("protocol violation: {message}")]
    Protocol { message: String },
    /// Any other socket failure.
    #[error("connection I/O error: {0}")]
    Io(#[source] io::Error),
}

impl ConnectionError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns true when the peer closed the stream mid-field.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Returns true when the failure means the peer went away, either by
    /// closing early or by resetting the socket.
    #[must_use]
    pub fn is_peer_abort(&self) -> bool {
        match self {
            Self::EndOfStream => true,
            Self::Io(error) => matches!(
                error.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            Self::EndOfStream
        } else {
            Self::Io(error)
        }
    }
}

/// Errors surfaced while binding or cleaning up the listening socket.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to prepare socket directory: {source}")]
    Prepare {
        #[source]
        source: EndpointPreparationError,
    },
    #[error("failed to bind unix listener at {path}: {source}")]
    BindUnix {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind abstract listener @{name}: {source}")]
    BindAbstract {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("abstract socket names are unsupported on this platform: @{name}")]
    UnsupportedAbstract { name: String },
    #[error("existing unix socket {path} is already in use")]
    UnixInUse { path: String },
    #[error("unix socket path {path} is not a socket")]
    UnixNotSocket { path: String },
    #[error("failed to read metadata for unix socket {path}: {source}")]
    UnixMetadata {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to existing unix socket {path}: {source}")]
    UnixConnect {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove stale unix socket {path}: {source}")]
    UnixCleanup {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while building a [`HandlerRegistry`](crate::HandlerRegistry).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The type code is reserved by the protocol.
    #[error("type code {type_code} is reserved")]
    Reserved { type_code: TypeCode },
    /// A handler is already registered for the type code.
    #[error("type code {type_code} already has a handler")]
    Duplicate { type_code: TypeCode },
}

/// Errors a handler may return. The dispatcher only reports them; encoding an
/// application error into the response is the handler's job.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Reading or writing a field failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Local I/O unrelated to the connection failed.
    #[error("handler I/O error: {0}")]
    Io(#[from] io::Error),
    /// Application-defined failure.
    #[error("{message}")]
    Application { message: String },
}

impl HandlerError {
    /// Builds an application-defined failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }
}

/// Errors that terminate the accept loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The service address was rejected before binding.
    #[error("invalid service address: {message}")]
    InvalidService { message: String },
    /// Binding the listening socket failed.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// The server is already serving.
    #[error("dispatcher is already serving")]
    AlreadyServing,
    /// Waiting for readiness on the listening socket failed.
    #[error("failed to poll listening socket: {source}")]
    Poll {
        #[source]
        source: io::Error,
    },
    /// Accepting a connection failed and the policy treats that as fatal.
    #[error("failed to accept connection: {source}")]
    Accept {
        #[source]
        source: io::Error,
    },
    /// Reading the header and type code failed for a reason other than the
    /// client going away.
    #[error("failed to read message preamble: {source}")]
    Preamble {
        #[source]
        source: ConnectionError,
    },
    /// Spawning a worker thread failed.
    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },
    /// The accept loop thread panicked.
    #[error("accept loop thread panicked")]
    ThreadPanic,
}
