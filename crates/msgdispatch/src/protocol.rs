//! Message framing: the two-byte header and the type code that follow every
//! connection open.
//!
//! Beyond the preamble the stream is schema-less. For each type code the
//! client and its handler agree out of band on an ordered list of fields;
//! nothing on the wire describes them, so reading fields in a different order
//! than they were written desynchronises the connection for good.

use crate::connection::Connection;
use crate::errors::ConnectionError;

/// Integer tag that selects the handler for a connection.
pub type TypeCode = u16;

/// Header bytes written by [`Connection::open`]. Never validated.
pub const HEADER: [u8; 2] = [1, 0];

/// Never registrable; marks the end of handler tables in older peers.
pub const TYPE_RESERVED: TypeCode = 0;

/// Liveness probe answered with a single `u8` zero unless the application
/// registers its own handler.
pub const TYPE_PING: TypeCode = 65534;

/// Reserved for the server's fatal path.
pub const TYPE_PANIC: TypeCode = 65535;

/// Returns true for type codes applications may not register.
#[must_use]
pub fn is_reserved(type_code: TypeCode) -> bool {
    matches!(type_code, TYPE_RESERVED | TYPE_PANIC)
}

/// Header and type code read off a freshly accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Reserved header bytes as sent by the client.
    pub header: [u8; 2],
    /// Dispatch key.
    pub type_code: TypeCode,
}

impl Preamble {
    /// Reads the header bytes followed by the type code.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::EndOfStream`] when the client disconnects
    /// before the type code is complete, and other connection errors as-is.
    pub fn read(connection: &mut Connection) -> Result<Self, ConnectionError> {
        let header = [connection.read_u8()?, connection.read_u8()?];
        let type_code = connection.read_type()?;
        Ok(Self { header, type_code })
    }
}
