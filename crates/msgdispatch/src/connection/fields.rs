//! Typed field operations.
//!
//! Integers travel big-endian at their natural width. Strings and byte
//! sequences carry a variable-width length prefix; see [`LengthPrefix`].

use std::io::Read;

use super::Connection;
use super::codec::{LengthPrefix, SPECIAL_NULL};
use crate::errors::ConnectionError;
use crate::protocol::TypeCode;

macro_rules! integer_fields {
    ($($read:ident, $write:ident => $ty:ty),+ $(,)?) => {
        $(
            #[doc = concat!("Reads one big-endian `", stringify!($ty), "`.")]
            ///
            /// # Errors
            ///
            /// Returns [`ConnectionError::EndOfStream`] when the peer closes
            /// first, or [`ConnectionError::Closed`].
            pub fn $read(&mut self) -> Result<$ty, ConnectionError> {
                Ok(<$ty>::from_be_bytes(self.read_array()?))
            }

            #[doc = concat!("Writes one big-endian `", stringify!($ty), "`.")]
            ///
            /// # Errors
            ///
            /// Returns the socket failure, or [`ConnectionError::Closed`].
            pub fn $write(&mut self, value: $ty) -> Result<(), ConnectionError> {
                self.write_all(&value.to_be_bytes())
            }
        )+
    };
}

impl Connection {
    integer_fields! {
        read_u8, write_u8 => u8,
        read_i8, write_i8 => i8,
        read_u16, write_u16 => u16,
        read_i16, write_i16 => i16,
        read_u32, write_u32 => u32,
        read_i32, write_i32 => i32,
        read_u64, write_u64 => u64,
        read_i64, write_i64 => i64,
    }

    /// Reads a message type code.
    ///
    /// # Errors
    ///
    /// See [`Connection::read_u16`].
    pub fn read_type(&mut self) -> Result<TypeCode, ConnectionError> {
        self.read_u16()
    }

    /// Writes a message type code.
    ///
    /// # Errors
    ///
    /// See [`Connection::write_u16`].
    pub fn write_type(&mut self, type_code: TypeCode) -> Result<(), ConnectionError> {
        self.write_u16(type_code)
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Protocol`] when the peer sent a null string
    /// or invalid UTF-8.
    pub fn read_string(&mut self) -> Result<String, ConnectionError> {
        self.read_optional_string()?
            .ok_or_else(|| ConnectionError::protocol("expected a string, received null"))
    }

    /// Writes a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidArgument`] when the string is longer
    /// than `u32::MAX` bytes, or the socket failure.
    pub fn write_string(&mut self, value: &str) -> Result<(), ConnectionError> {
        self.write_bytes(value.as_bytes())
    }

    /// Reads a string that may be null.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Protocol`] for invalid UTF-8 or an unknown
    /// special marker.
    pub fn read_optional_string(&mut self) -> Result<Option<String>, ConnectionError> {
        match LengthPrefix::read_from(self.stream_mut()?)? {
            LengthPrefix::Special(SPECIAL_NULL) => Ok(None),
            LengthPrefix::Special(marker) => Err(ConnectionError::protocol(format!(
                "unexpected special marker {marker} in string field"
            ))),
            LengthPrefix::Length(length) => {
                let bytes = self.read_payload(length)?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|_| ConnectionError::protocol("string field is not valid UTF-8"))
            }
        }
    }

    /// Writes a string, or the null marker for `None`.
    ///
    /// # Errors
    ///
    /// See [`Connection::write_string`].
    pub fn write_optional_string(&mut self, value: Option<&str>) -> Result<(), ConnectionError> {
        match value {
            Some(value) => self.write_string(value),
            None => {
                LengthPrefix::Special(SPECIAL_NULL).write_to(self.stream_mut()?)?;
                Ok(())
            }
        }
    }

    /// Reads a length-prefixed byte sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Protocol`] when the prefix is a special
    /// marker, and [`ConnectionError::EndOfStream`] when the payload is short.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, ConnectionError> {
        match LengthPrefix::read_from(self.stream_mut()?)? {
            LengthPrefix::Length(length) => self.read_payload(length),
            LengthPrefix::Special(marker) => Err(ConnectionError::protocol(format!(
                "unexpected special marker {marker} in byte field"
            ))),
        }
    }

    /// Writes a length-prefixed byte sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidArgument`] when `value` is longer
    /// than `u32::MAX` bytes, or the socket failure.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), ConnectionError> {
        let length = u32::try_from(value.len()).map_err(|_| {
            ConnectionError::invalid_argument(format!(
                "field of {} bytes exceeds the length prefix range",
                value.len()
            ))
        })?;
        LengthPrefix::Length(length).write_to(self.stream_mut()?)?;
        self.write_all(value)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ConnectionError> {
        let mut bytes = [0_u8; N];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_payload(&mut self, length: u32) -> Result<Vec<u8>, ConnectionError> {
        let expected = u64::from(length);
        let mut bytes = Vec::new();
        self.stream_mut()?
            .take(expected)
            .read_to_end(&mut bytes)?;
        if bytes.len() as u64 == expected {
            Ok(bytes)
        } else {
            Err(ConnectionError::EndOfStream)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn pair() -> (Connection, Connection) {
        let (left, right) = UnixStream::pair().expect("socket pair");
        (Connection::from_stream(left), Connection::from_stream(right))
    }

    #[rstest]
    fn integers_keep_boundary_values(pair: (Connection, Connection)) {
        let (mut writer, mut reader) = pair;
        writer.write_u8(u8::MAX).expect("u8");
        writer.write_i8(i8::MIN).expect("i8");
        writer.write_u16(u16::MAX).expect("u16");
        writer.write_i16(i16::MIN).expect("i16");
        writer.write_u32(0).expect("u32");
        writer.write_i32(i32::MIN).expect("i32");
        writer.write_u64(u64::MAX).expect("u64");
        writer.write_i64(i64::MAX).expect("i64");

        assert_eq!(reader.read_u8().expect("u8"), u8::MAX);
        assert_eq!(reader.read_i8().expect("i8"), i8::MIN);
        assert_eq!(reader.read_u16().expect("u16"), u16::MAX);
        assert_eq!(reader.read_i16().expect("i16"), i16::MIN);
        assert_eq!(reader.read_u32().expect("u32"), 0);
        assert_eq!(reader.read_i32().expect("i32"), i32::MIN);
        assert_eq!(reader.read_u64().expect("u64"), u64::MAX);
        assert_eq!(reader.read_i64().expect("i64"), i64::MAX);
    }

    #[rstest]
    fn integers_are_big_endian(pair: (Connection, Connection)) {
        let (mut writer, mut reader) = pair;
        writer.write_u32(0x0102_0304).expect("u32");
        let mut raw = [0_u8; 4];
        reader.read_exact(&mut raw).expect("raw bytes");
        assert_eq!(raw, [1, 2, 3, 4]);
    }

    #[rstest]
    #[case("")]
    #[case("foobar")]
    #[case("héllo wörld")]
    fn strings_survive_the_wire(pair: (Connection, Connection), #[case] value: &str) {
        let (mut writer, mut reader) = pair;
        writer.write_string(value).expect("write string");
        assert_eq!(reader.read_string().expect("read string"), value);
    }

    #[rstest]
    fn null_string_is_distinct_from_empty(pair: (Connection, Connection)) {
        let (mut writer, mut reader) = pair;
        writer.write_optional_string(None).expect("null");
        writer.write_optional_string(Some("")).expect("empty");
        writer.write_optional_string(None).expect("null again");

        assert_eq!(reader.read_optional_string().expect("null"), None);
        assert_eq!(
            reader.read_optional_string().expect("empty"),
            Some(String::new())
        );
        let error = reader.read_string().expect_err("null is not a string");
        assert!(matches!(error, ConnectionError::Protocol { .. }));
    }

    #[rstest]
    fn invalid_utf8_is_a_protocol_error(pair: (Connection, Connection)) {
        let (mut writer, mut reader) = pair;
        writer.write_bytes(&[0xC3, 0x28]).expect("write bytes");
        let error = reader.read_string().expect_err("not utf-8");
        assert!(matches!(error, ConnectionError::Protocol { .. }));
    }

    #[rstest]
    #[case(0)]
    #[case(191)]
    #[case(192)]
    #[case(8383)]
    #[case(8384)]
    fn byte_sequences_cross_prefix_widths(pair: (Connection, Connection), #[case] length: usize) {
        let (mut writer, mut reader) = pair;
        let payload: Vec<u8> = (0..length).map(|index| (index % 251) as u8).collect();
        let sender = std::thread::spawn(move || {
            writer.write_bytes(&payload).expect("write bytes");
            payload
        });
        let received = reader.read_bytes().expect("read bytes");
        let payload = sender.join().expect("writer thread");
        assert_eq!(received, payload);
    }

    #[rstest]
    fn short_payload_is_end_of_stream(pair: (Connection, Connection)) {
        let (mut writer, mut reader) = pair;
        writer.write_all(&[10, b'a', b'b']).expect("partial payload");
        writer.close().expect("close writer");

        let error = reader.read_bytes().expect_err("payload is short");
        assert!(error.is_end_of_stream());
    }

    #[rstest]
    fn short_integer_is_end_of_stream(pair: (Connection, Connection)) {
        let (mut writer, mut reader) = pair;
        writer.write_u16(7).expect("u16");
        writer.close().expect("close writer");

        let error = reader.read_u32().expect_err("integer is short");
        assert!(error.is_end_of_stream());
    }
}
