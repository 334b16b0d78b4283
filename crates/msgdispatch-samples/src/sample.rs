//! Sample service exercising every field kind, plus its client calls.
//!
//! Replies open with a type code: [`T_RESULT`] followed by the payload, or
//! [`T_ERROR`] followed by a `u16` error code.

use std::fs::File;

use tracing::warn;

use msgdispatch::{
    Connection, ConnectionError, HandlerError, HandlerRegistry, OpenFlags, RegistryError,
    ServiceEndpoint, TypeCode,
};

/// Reply tag for failures; a `u16` error code follows.
pub const T_ERROR: TypeCode = 8;
/// Reply tag for successes.
pub const T_RESULT: TypeCode = 9;
/// `i32` n in, n! out.
pub const COMP_FACT: TypeCode = 10;
/// Replies with a descriptor for `/dev/urandom`.
pub const OPEN_RAND: TypeCode = 11;
/// Typed fields in, the same fields out in reverse order.
pub const ROUND_TRIP: TypeCode = 12;
/// Three byte sequences in, their total length and the sequences out.
pub const A_FEW_BYTES: TypeCode = 13;
/// Replies with a descriptor for `/dev/zero`.
pub const OPEN_ZERO: TypeCode = 14;

/// Error code sent after [`T_ERROR`].
pub const ERROR_CODE: u16 = 1;

const SAMPLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::sample");

/// Handler table for the sample service.
///
/// # Errors
///
/// Never fails in practice; the codes are distinct and unreserved.
pub fn registry() -> Result<HandlerRegistry, RegistryError> {
    Ok(HandlerRegistry::builder()
        .register(COMP_FACT, comp_fact)?
        .register(OPEN_RAND, open_rand)?
        .register(ROUND_TRIP, round_trip)?
        .register(A_FEW_BYTES, a_few_bytes)?
        .register(OPEN_ZERO, open_zero)?
        .build())
}

/// Returns `n!` when `n` is non-negative and the result fits an `i32`.
#[must_use]
pub fn factorial(n: i32) -> Option<i32> {
    if n < 0 {
        return None;
    }
    (2..=n).try_fold(1_i32, i32::checked_mul)
}

/// Fields carried by a [`ROUND_TRIP`] request, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTrip {
    pub type_code: TypeCode,
    pub unsigned64: u64,
    pub signed64: i64,
    pub unsigned32: u32,
    pub signed32: i32,
    pub unsigned16: u16,
    pub unsigned8: u8,
    pub text: String,
}

impl RoundTrip {
    fn read(connection: &mut Connection) -> Result<Self, ConnectionError> {
        Ok(Self {
            type_code: connection.read_type()?,
            unsigned64: connection.read_u64()?,
            signed64: connection.read_i64()?,
            unsigned32: connection.read_u32()?,
            signed32: connection.read_i32()?,
            unsigned16: connection.read_u16()?,
            unsigned8: connection.read_u8()?,
            text: connection.read_string()?,
        })
    }

    fn write(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        connection.write_type(self.type_code)?;
        connection.write_u64(self.unsigned64)?;
        connection.write_i64(self.signed64)?;
        connection.write_u32(self.unsigned32)?;
        connection.write_i32(self.signed32)?;
        connection.write_u16(self.unsigned16)?;
        connection.write_u8(self.unsigned8)?;
        connection.write_string(&self.text)
    }

    fn write_reversed(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        connection.write_string(&self.text)?;
        connection.write_u8(self.unsigned8)?;
        connection.write_u16(self.unsigned16)?;
        connection.write_i32(self.signed32)?;
        connection.write_u32(self.unsigned32)?;
        connection.write_i64(self.signed64)?;
        connection.write_u64(self.unsigned64)?;
        connection.write_type(self.type_code)
    }

    fn read_reversed(connection: &mut Connection) -> Result<Self, ConnectionError> {
        let text = connection.read_string()?;
        let unsigned8 = connection.read_u8()?;
        let unsigned16 = connection.read_u16()?;
        let signed32 = connection.read_i32()?;
        let unsigned32 = connection.read_u32()?;
        let signed64 = connection.read_i64()?;
        let unsigned64 = connection.read_u64()?;
        let type_code = connection.read_type()?;
        Ok(Self {
            type_code,
            unsigned64,
            signed64,
            unsigned32,
            signed32,
            unsigned16,
            unsigned8,
            text,
        })
    }
}

/// Outcome of a tagged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    /// The server answered [`T_RESULT`].
    Value(T),
    /// The server answered [`T_ERROR`] with this code.
    Error(u16),
}

/// Client for the sample service.
#[derive(Debug, Clone)]
pub struct SampleClient {
    endpoint: ServiceEndpoint,
}

impl SampleClient {
    /// Targets the service listening on `endpoint`.
    #[must_use]
    pub fn new(endpoint: ServiceEndpoint) -> Self {
        Self { endpoint }
    }

    /// Address this client dials.
    #[must_use]
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Asks the server for `n!`.
    ///
    /// # Errors
    ///
    /// Fails when the exchange breaks or the reply tag is unknown.
    pub fn factorial(&self, n: i32) -> Result<Reply<i32>, ConnectionError> {
        let mut connection = self.request(COMP_FACT)?;
        connection.write_i32(n)?;
        read_reply(&mut connection, Connection::read_i32)
    }

    /// Sends `fields` and returns what the server mirrored back.
    ///
    /// # Errors
    ///
    /// Fails when the exchange breaks or the reply tag is unknown.
    pub fn round_trip(&self, fields: &RoundTrip) -> Result<Reply<RoundTrip>, ConnectionError> {
        let mut connection = self.request(ROUND_TRIP)?;
        fields.write(&mut connection)?;
        read_reply(&mut connection, RoundTrip::read_reversed)
    }

    /// Sends three byte sequences; the reply carries the total length and
    /// the sequences as received.
    ///
    /// # Errors
    ///
    /// Fails when the exchange breaks or the reply tag is unknown.
    pub fn a_few_bytes(
        &self,
        sequences: [&[u8]; 3],
    ) -> Result<Reply<(u32, [Vec<u8>; 3])>, ConnectionError> {
        let mut connection = self.request(A_FEW_BYTES)?;
        for sequence in sequences {
            connection.write_bytes(sequence)?;
        }
        read_reply(&mut connection, |connection| {
            let total = connection.read_u32()?;
            let first = connection.read_bytes()?;
            let second = connection.read_bytes()?;
            let third = connection.read_bytes()?;
            Ok((total, [first, second, third]))
        })
    }

    /// Requests a descriptor for `/dev/urandom`.
    ///
    /// # Errors
    ///
    /// Fails when the exchange breaks or the reply tag is unknown.
    pub fn open_random(&self) -> Result<Reply<File>, ConnectionError> {
        let mut connection = self.request(OPEN_RAND)?;
        read_reply(&mut connection, Connection::read_file)
    }

    /// Requests a descriptor for `/dev/zero`.
    ///
    /// # Errors
    ///
    /// Fails when the exchange breaks or the reply tag is unknown.
    pub fn open_zero(&self) -> Result<Reply<File>, ConnectionError> {
        let mut connection = self.request(OPEN_ZERO)?;
        read_reply(&mut connection, Connection::read_file)
    }

    fn request(&self, type_code: TypeCode) -> Result<Connection, ConnectionError> {
        let mut connection = Connection::connect(&self.endpoint, OpenFlags::LOCAL)?;
        connection.write_type(type_code)?;
        Ok(connection)
    }
}

fn read_reply<T>(
    connection: &mut Connection,
    read_value: impl FnOnce(&mut Connection) -> Result<T, ConnectionError>,
) -> Result<Reply<T>, ConnectionError> {
    match connection.read_type()? {
        T_RESULT => read_value(connection).map(Reply::Value),
        T_ERROR => connection.read_u16().map(Reply::Error),
        other => Err(ConnectionError::Protocol {
            message: format!("unexpected reply tag {other}"),
        }),
    }
}

fn reply_error(connection: &mut Connection) -> Result<(), HandlerError> {
    connection.write_type(T_ERROR)?;
    connection.write_u16(ERROR_CODE)?;
    Ok(())
}

// A malformed or truncated request gets an error reply while the peer is
// still reading; when the reply cannot be sent the read failure is reported.
fn reply_to_bad_request(
    connection: &mut Connection,
    type_code: TypeCode,
    error: ConnectionError,
) -> Result<(), HandlerError> {
    warn!(target: SAMPLE_TARGET, type_code, %error, "rejecting malformed request");
    reply_error(connection).map_err(|_| HandlerError::from(error))
}

fn comp_fact(type_code: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    let n = match connection.read_i32() {
        Ok(n) => n,
        Err(error) => return reply_to_bad_request(connection, type_code, error),
    };
    match factorial(n) {
        Some(value) => {
            connection.write_type(T_RESULT)?;
            connection.write_i32(value)?;
            Ok(())
        }
        None => reply_error(connection),
    }
}

fn open_device(connection: &mut Connection, path: &str) -> Result<(), HandlerError> {
    match File::open(path) {
        Ok(device) => {
            connection.write_type(T_RESULT)?;
            connection.write_file(&device)?;
            Ok(())
        }
        Err(error) => {
            warn!(target: SAMPLE_TARGET, path, %error, "failed to open device");
            reply_error(connection)
        }
    }
}

fn open_rand(_: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    open_device(connection, "/dev/urandom")
}

fn open_zero(_: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    open_device(connection, "/dev/zero")
}

fn round_trip(type_code: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    match RoundTrip::read(connection) {
        Ok(fields) => {
            connection.write_type(T_RESULT)?;
            fields.write_reversed(connection)?;
            Ok(())
        }
        Err(error) => reply_to_bad_request(connection, type_code, error),
    }
}

fn a_few_bytes(type_code: TypeCode, connection: &mut Connection) -> Result<(), HandlerError> {
    let sequences = (0..3)
        .map(|_| connection.read_bytes())
        .collect::<Result<Vec<_>, _>>();
    let sequences = match sequences {
        Ok(sequences) => sequences,
        Err(error) => return reply_to_bad_request(connection, type_code, error),
    };
    let total: usize = sequences.iter().map(Vec::len).sum();
    let Ok(total) = u32::try_from(total) else {
        return reply_error(connection);
    };
    connection.write_type(T_RESULT)?;
    connection.write_u32(total)?;
    for sequence in &sequences {
        connection.write_bytes(sequence)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, Some(1))]
    #[case(1, Some(1))]
    #[case(5, Some(120))]
    #[case(10, Some(3_628_800))]
    #[case(12, Some(479_001_600))]
    #[case(13, None)]
    #[case(15, None)]
    #[case(-7, None)]
    fn factorial_fits_a_signed_word(#[case] n: i32, #[case] expected: Option<i32>) {
        assert_eq!(factorial(n), expected);
    }

    #[test]
    fn registers_every_sample_code() {
        let registry = registry().expect("registry");
        assert_eq!(
            registry.type_codes(),
            vec![COMP_FACT, OPEN_RAND, ROUND_TRIP, A_FEW_BYTES, OPEN_ZERO]
        );
    }
}
