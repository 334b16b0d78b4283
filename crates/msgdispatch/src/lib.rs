//! Type-tagged binary messages over local sockets, and a bounded
//! thread-per-connection server that dispatches them.
//!
//! One connection carries one exchange. The client dials a service with
//! [`Connection::open`], which writes the two reserved header bytes. It then
//! writes a [`TypeCode`] followed by the request fields that the type code's
//! contract prescribes, and reads the response fields back in the agreed
//! order. Nothing on the wire describes the fields; both peers must agree.
//!
//! On the server side a [`Dispatcher`] owns the listening socket, a
//! [`HandlerRegistry`] keyed by type code and a [`ConcurrencyLimiter`]. Each
//! admitted connection runs its [`Handler`] on its own thread; the
//! connection is closed and the concurrency slot returned however the handler
//! exits, including by panicking.
//!
//! ## Failure isolation
//!
//! Errors local to one connection never stop the accept loop:
//!
//! - a client that disconnects before sending its type code is ignored;
//! - an unknown type code closes that connection without a response;
//! - a handler error or panic is reported through the [`DispatchObserver`].
//!
//! Only failures of the loop's own poll, accept or preamble read are fatal,
//! and they surface as a [`DispatchError`].
//!
//! ## Shutdown
//!
//! [`Dispatcher::shutdown`] clears the active flag, which the loop checks
//! between iterations. Configure a poll timeout with
//! [`DispatcherConfig::with_poll_timeout`] to bound how long that takes; a
//! loop without one stays blocked in `accept` until another client arrives.

mod connection;
mod dispatcher;
mod errors;
mod limiter;
mod listener;
mod observer;
pub mod protocol;
mod registry;
pub mod shutdown;
pub mod telemetry;

pub use connection::{Connection, OpenFlags};
pub use dispatcher::{
    AcceptFailurePolicy, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherState, listen,
};
pub use errors::{
    ConnectionError, DispatchError, HandlerError, ListenerError, RegistryError,
};
pub use limiter::{ConcurrencyLimiter, Permit};
pub use listener::{LocalListener, Readiness};
pub use msgdispatch_config::ServiceEndpoint;
pub use observer::{DispatchObserver, HandlerFailure, StructuredObserver};
pub use protocol::{Preamble, TypeCode};
pub use registry::{Handler, HandlerRegistry, HandlerRegistryBuilder, PingHandler, handler_fn};

#[cfg(test)]
mod tests;
