//! Scoped ownership of one local-domain socket.
//!
//! A [`Connection`] is created either by dialling a service
//! ([`Connection::open`]) or by taking a pending connection off a listening
//! socket ([`Connection::accept`]). The descriptor is released exactly once:
//! by an explicit [`Connection::close`] or when the value is dropped on any
//! exit path. Every field operation on a closed connection fails with
//! [`ConnectionError::Closed`].

mod codec;
mod descriptors;
mod fields;

use std::fmt;
use std::io::{Read, Write};
use std::ops::BitOr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use tracing::trace;

use msgdispatch_config::ServiceEndpoint;

use crate::errors::ConnectionError;
use crate::protocol::HEADER;

const CONNECTION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::connection");

/// Transport selection and behaviour flags for [`Connection::open`] and
/// [`listen`](crate::listen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Use a local-domain socket. The only supported transport.
    pub const LOCAL: Self = Self(1);
    /// When listening, serve on the calling thread instead of returning.
    pub const NORETURN: Self = Self(2);
    /// Put the client socket in non-blocking mode.
    pub const NONBLOCK: Self = Self(4);

    /// Returns true when every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One open local-domain socket carrying a single request/response exchange.
pub struct Connection {
    stream: Option<UnixStream>,
    poisoned: bool,
}

impl Connection {
    /// Dials `service` and writes the protocol header.
    ///
    /// `host` is reserved for non-local transports and must be absent or
    /// empty. `flags` must include [`OpenFlags::LOCAL`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidArgument`] for a non-empty host, a
    /// missing `LOCAL` flag or a malformed service name, and
    /// [`ConnectionError::Connect`] when nothing answers at the address.
    pub fn open(
        host: Option<&str>,
        service: &str,
        flags: OpenFlags,
    ) -> Result<Self, ConnectionError> {
        validate_host(host)?;
        let endpoint: ServiceEndpoint = service
            .parse()
            .map_err(|error| ConnectionError::invalid_argument(format!("{error}")))?;
        Self::connect(&endpoint, flags)
    }

    /// Dials a parsed endpoint and writes the protocol header.
    ///
    /// # Errors
    ///
    /// See [`Connection::open`].
    pub fn connect(endpoint: &ServiceEndpoint, flags: OpenFlags) -> Result<Self, ConnectionError> {
        if !flags.contains(OpenFlags::LOCAL) {
            return Err(ConnectionError::invalid_argument(
                "only local-domain connections are supported",
            ));
        }

        let stream = dial(endpoint).map_err(|source| ConnectionError::Connect {
            service: endpoint.to_string(),
            source,
        })?;
        if flags.contains(OpenFlags::NONBLOCK) {
            stream.set_nonblocking(true)?;
        }

        let mut connection = Self::from_stream(stream);
        if let Err(error) = connection.write_all(&HEADER) {
            connection.poison();
            return Err(error);
        }
        trace!(target: CONNECTION_TARGET, service = %endpoint, "connection opened");
        Ok(connection)
    }

    /// Takes one pending connection off `listener`, blocking until a client
    /// arrives when none is queued.
    ///
    /// # Errors
    ///
    /// Propagates the accept failure; interrupted calls are retried.
    pub fn accept(listener: &UnixListener) -> Result<Self, ConnectionError> {
        loop {
            match listener.accept() {
                Ok((stream, _)) => return Ok(Self::from_stream(stream)),
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => return Err(ConnectionError::Io(error)),
            }
        }
    }

    /// Wraps an already connected stream without writing a header.
    #[must_use]
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream: Some(stream),
            poisoned: false,
        }
    }

    /// Returns true once the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Underlying descriptor, for lower-level OS calls.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after the connection is closed.
    pub fn fileno(&self) -> Result<RawFd, ConnectionError> {
        self.stream().map(AsRawFd::as_raw_fd)
    }

    /// Marks the connection so that closing it always releases the socket.
    /// Connections are never cached, so this only records the mark.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Returns true when [`Connection::poison`] has been called.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Releases the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] when called a second time; the
    /// descriptor is never released twice.
    pub fn close(&mut self) -> Result<(), ConnectionError> {
        let stream = self.stream.take().ok_or(ConnectionError::Closed)?;
        trace!(
            target: CONNECTION_TARGET,
            fd = stream.as_raw_fd(),
            poisoned = self.poisoned,
            "connection closed"
        );
        drop(stream);
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::EndOfStream`] when the peer closes first.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        self.stream_mut()?.read_exact(buf)?;
        Ok(())
    }

    /// Writes all of `buf`; there are no short writes.
    ///
    /// # Errors
    ///
    /// Returns the socket failure, or [`ConnectionError::Closed`].
    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectionError> {
        self.stream_mut()?.write_all(buf)?;
        Ok(())
    }

    fn stream(&self) -> Result<&UnixStream, ConnectionError> {
        self.stream.as_ref().ok_or(ConnectionError::Closed)
    }

    fn stream_mut(&mut self) -> Result<&mut UnixStream, ConnectionError> {
        self.stream.as_mut().ok_or(ConnectionError::Closed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("fd", &self.stream.as_ref().map(AsRawFd::as_raw_fd))
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

fn validate_host(host: Option<&str>) -> Result<(), ConnectionError> {
    match host {
        None | Some("") => Ok(()),
        Some(other) => Err(ConnectionError::invalid_argument(format!(
            "host '{other}' is not supported for local connections"
        ))),
    }
}

fn dial(endpoint: &ServiceEndpoint) -> std::io::Result<UnixStream> {
    match endpoint {
        ServiceEndpoint::Path(path) => UnixStream::connect(path.as_std_path()),
        ServiceEndpoint::Abstract(name) => dial_abstract(name),
    }
}

#[cfg(target_os = "linux")]
fn dial_abstract(name: &str) -> std::io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let address = SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixStream::connect_addr(&address)
}

#[cfg(not(target_os = "linux"))]
fn dial_abstract(name: &str) -> std::io::Result<UnixStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("abstract socket @{name} is unsupported on this platform"),
    ))
}
