//! Descriptor passing over the connection's ancillary-data channel.
//!
//! The sender keeps its descriptor; the kernel installs a duplicate in the
//! receiving process, which then owns it outright.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use passfd::FdPassingExt;
use tracing::trace;

use super::{CONNECTION_TARGET, Connection};
use crate::errors::ConnectionError;

impl Connection {
    /// Sends one open descriptor to the peer.
    ///
    /// # Errors
    ///
    /// Returns the `sendmsg` failure, or [`ConnectionError::Closed`].
    pub fn write_fd(&mut self, fd: impl AsFd) -> Result<(), ConnectionError> {
        let raw = fd.as_fd().as_raw_fd();
        self.stream()?.as_raw_fd().send_fd(raw)?;
        trace!(target: CONNECTION_TARGET, fd = raw, "descriptor sent");
        Ok(())
    }

    /// Receives one descriptor from the peer.
    ///
    /// # Errors
    ///
    /// Returns the `recvmsg` failure, including the peer closing without
    /// sending a descriptor, or [`ConnectionError::Closed`].
    pub fn read_fd(&mut self) -> Result<OwnedFd, ConnectionError> {
        let raw = self.stream()?.as_raw_fd().recv_fd()?;
        trace!(target: CONNECTION_TARGET, fd = raw, "descriptor received");
        // SAFETY: `recv_fd` returns a freshly installed descriptor that no
        // other owner in this process refers to.
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Sends an open file to the peer.
    ///
    /// # Errors
    ///
    /// See [`Connection::write_fd`].
    pub fn write_file(&mut self, file: &File) -> Result<(), ConnectionError> {
        self.write_fd(file)
    }

    /// Receives a descriptor and wraps it as a [`File`].
    ///
    /// # Errors
    ///
    /// See [`Connection::read_fd`].
    pub fn read_file(&mut self) -> Result<File, ConnectionError> {
        self.read_fd().map(File::from)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (Connection, Connection) {
        let (left, right) = UnixStream::pair().expect("socket pair");
        (Connection::from_stream(left), Connection::from_stream(right))
    }

    #[test]
    fn sender_keeps_its_descriptor() {
        let (mut writer, mut reader) = pair();
        let mut original = tempfile::tempfile().expect("temp file");
        original.write_all(b"shared").expect("write temp file");

        writer.write_file(&original).expect("send file");
        let mut received = reader.read_file().expect("receive file");

        original.write_all(b" state").expect("sender fd still usable");
        received.seek(SeekFrom::Start(0)).expect("rewind");
        let mut contents = String::new();
        received.read_to_string(&mut contents).expect("read received");
        assert_eq!(contents, "shared state");
    }

    #[test]
    fn received_descriptor_is_distinct() {
        let (mut writer, mut reader) = pair();
        let file = File::open("/dev/zero").expect("open /dev/zero");

        writer.write_fd(&file).expect("send fd");
        let received = reader.read_fd().expect("receive fd");
        assert_ne!(received.as_raw_fd(), file.as_raw_fd());

        let mut zeros = [0xAA_u8; 8];
        File::from(received).read_exact(&mut zeros).expect("read zeros");
        assert_eq!(zeros, [0_u8; 8]);
    }

    #[test]
    fn closed_connection_cannot_pass_descriptors() {
        let (mut writer, _reader) = pair();
        writer.close().expect("close");
        let file = File::open("/dev/zero").expect("open /dev/zero");
        assert!(matches!(writer.write_fd(&file), Err(ConnectionError::Closed)));
    }
}
