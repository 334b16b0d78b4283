//! Listening socket owned by the accept loop.
//!
//! Binding clears a stale socket file left behind by a crashed server but
//! refuses to steal a path another server still answers on. The socket file
//! is removed again when the listener is dropped.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use msgdispatch_config::ServiceEndpoint;

use crate::connection::Connection;
use crate::errors::{ConnectionError, ListenerError};

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::listener");

/// Outcome of waiting for an incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A connection is queued, or the socket reported an exceptional
    /// condition that `accept` will surface.
    Ready,
    /// The timeout elapsed or the wait was interrupted by a signal.
    Idle,
}

/// Bound local-domain listening socket.
#[derive(Debug)]
pub struct LocalListener {
    endpoint: ServiceEndpoint,
    listener: UnixListener,
}

impl LocalListener {
    /// Binds `endpoint`, preparing the parent directory of filesystem
    /// sockets and clearing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns a [`ListenerError`] when the path is in use, is not a socket,
    /// or cannot be bound.
    pub fn bind(endpoint: &ServiceEndpoint) -> Result<Self, ListenerError> {
        let listener = match endpoint {
            ServiceEndpoint::Path(path) => {
                endpoint
                    .prepare_filesystem()
                    .map_err(|source| ListenerError::Prepare { source })?;
                bind_path(path.as_std_path())?
            }
            ServiceEndpoint::Abstract(name) => bind_abstract(name)?,
        };
        debug!(target: LISTENER_TARGET, endpoint = %endpoint, "listening socket bound");
        Ok(Self {
            endpoint: endpoint.clone(),
            listener,
        })
    }

    /// Address this listener is bound to.
    #[must_use]
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Waits up to `timeout` for a pending connection.
    ///
    /// # Errors
    ///
    /// Returns the `poll` failure other than an interrupted wait.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let millis = poll_millis(timeout);
        let mut pollfd = libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pollfd` is a valid, exclusively borrowed array of length
        // one for the duration of the call.
        let result = unsafe { libc::poll(&raw mut pollfd, 1, millis) };
        match result {
            0 => Ok(Readiness::Idle),
            ready if ready > 0 => {
                if pollfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                    Ok(Readiness::Ready)
                } else {
                    Ok(Readiness::Idle)
                }
            }
            _ => {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    Ok(Readiness::Idle)
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Takes one pending connection, blocking when none is queued.
    ///
    /// # Errors
    ///
    /// Returns the `accept` failure; interrupted calls are retried.
    pub fn accept(&self) -> io::Result<Connection> {
        Connection::accept(&self.listener).map_err(|error| match error {
            ConnectionError::Io(source) => source,
            other => io::Error::other(other),
        })
    }
}

impl AsRawFd for LocalListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        let Some(path) = self.endpoint.filesystem_path() else {
            return;
        };
        if let Err(error) = fs::remove_file(path.as_std_path())
            && error.kind() != io::ErrorKind::NotFound
        {
            warn!(
                target: LISTENER_TARGET,
                error = %error,
                path = %path,
                "failed to remove unix socket file"
            );
        }
    }
}

fn bind_path(path: &Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        let metadata =
            fs::symlink_metadata(path).map_err(|source| ListenerError::UnixMetadata {
                path: path.display().to_string(),
                source,
            })?;
        if !metadata.file_type().is_socket() {
            return Err(ListenerError::UnixNotSocket {
                path: path.display().to_string(),
            });
        }
        match UnixStream::connect(path) {
            Ok(_stream) => {
                return Err(ListenerError::UnixInUse {
                    path: path.display().to_string(),
                });
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                ) =>
            {
                debug!(
                    target: LISTENER_TARGET,
                    path = %path.display(),
                    "removing stale unix socket"
                );
                fs::remove_file(path).map_err(|source| ListenerError::UnixCleanup {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            Err(error) => {
                return Err(ListenerError::UnixConnect {
                    path: path.display().to_string(),
                    source: error,
                });
            }
        }
    }

    UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> Result<UnixListener, ListenerError> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let to_error = |source| ListenerError::BindAbstract {
        name: name.to_string(),
        source,
    };
    let address = SocketAddr::from_abstract_name(name.as_bytes()).map_err(to_error)?;
    UnixListener::bind_addr(&address).map_err(to_error)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(name: &str) -> Result<UnixListener, ListenerError> {
    Err(ListenerError::UnsupportedAbstract {
        name: name.to_string(),
    })
}

// Rounds up so that a sub-millisecond timeout still sleeps instead of
// turning into a non-blocking poll.
fn poll_millis(timeout: Duration) -> libc::c_int {
    libc::c_int::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(libc::c_int::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rstest::rstest;

    use super::*;

    fn endpoint_in(dir: &tempfile::TempDir, name: &str) -> ServiceEndpoint {
        let path = dir.path().join(name);
        ServiceEndpoint::path(path.to_str().expect("utf8 path"))
    }

    #[test]
    fn cleans_stale_socket_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir, "stale.sock");
        let path = endpoint.filesystem_path().expect("path endpoint").to_path_buf();
        {
            let _stale = UnixListener::bind(path.as_std_path()).expect("bind stale listener");
        }
        assert!(path.exists(), "stale socket should remain");

        let listener = LocalListener::bind(&endpoint).expect("bind over stale socket");
        UnixStream::connect(path.as_std_path()).expect("connect client");
        drop(listener);
        assert!(!path.exists(), "socket file removed on drop");
    }

    #[rstest]
    #[case(Duration::ZERO, 0)]
    #[case(Duration::from_micros(1), 1)]
    #[case(Duration::from_micros(500), 1)]
    #[case(Duration::from_millis(20), 20)]
    #[case(Duration::from_micros(20_001), 21)]
    #[case(Duration::from_secs(u64::MAX), libc::c_int::MAX)]
    fn poll_timeout_rounds_up_to_whole_milliseconds(
        #[case] timeout: Duration,
        #[case] expected: libc::c_int,
    ) {
        assert_eq!(poll_millis(timeout), expected);
    }

    #[test]
    fn rejects_in_use_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir, "busy.sock");
        let _existing = LocalListener::bind(&endpoint).expect("bind first listener");

        let error = LocalListener::bind(&endpoint).expect_err("path is in use");
        assert!(matches!(error, ListenerError::UnixInUse { .. }));
    }

    #[test]
    fn rejects_regular_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir, "plain.sock");
        let path = endpoint.filesystem_path().expect("path endpoint");
        fs::write(path.as_std_path(), b"not a socket").expect("write file");

        let error = LocalListener::bind(&endpoint).expect_err("path is a file");
        assert!(matches!(error, ListenerError::UnixNotSocket { .. }));
    }

    #[test]
    fn readiness_reflects_pending_clients() {
        let dir = tempfile::tempdir().expect("temp dir");
        let endpoint = endpoint_in(&dir, "ready.sock");
        let listener = LocalListener::bind(&endpoint).expect("bind listener");

        let started = Instant::now();
        let idle = listener
            .wait_readable(Duration::from_millis(50))
            .expect("wait without clients");
        assert_eq!(idle, Readiness::Idle);
        assert!(started.elapsed() >= Duration::from_millis(40));

        let path = endpoint.filesystem_path().expect("path endpoint");
        let _client = UnixStream::connect(path.as_std_path()).expect("connect client");
        let ready = listener
            .wait_readable(Duration::from_secs(2))
            .expect("wait with a client queued");
        assert_eq!(ready, Readiness::Ready);
        listener.accept().expect("accept queued client");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn binds_abstract_names() {
        let name = format!("msgdispatch-listener-test-{}", std::process::id());
        let endpoint = ServiceEndpoint::Abstract(name);
        let listener = LocalListener::bind(&endpoint).expect("bind abstract");
        let _client = Connection::connect(&endpoint, crate::OpenFlags::LOCAL)
            .expect("connect abstract");
        listener.accept().expect("accept abstract client");
    }
}
