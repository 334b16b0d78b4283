//! Variable-width length prefix shared by strings and byte sequences.
//!
//! The encoding packs small lengths into one byte and medium lengths into
//! two, falling back to a marker byte plus a big-endian `u32`:
//!
//! | lead byte   | meaning                                      |
//! |-------------|----------------------------------------------|
//! | `0..=191`   | length is the byte itself                    |
//! | `192..=223` | two bytes: `(lead - 192) * 256 + next + 192` |
//! | `224..=254` | special marker `lead & 0x1F`, no payload     |
//! | `255`       | length is the following big-endian `u32`     |

use std::io::{self, Read, Write};

const ONE_BYTE_LIMIT: u32 = 191;
const TWO_BYTE_LIMIT: u32 = 8383;
const TWO_BYTE_BASE: u8 = 192;
const SPECIAL_BASE: u8 = 0xE0;
const FOUR_BYTE_MARKER: u8 = 0xFF;

/// Special marker carried by an absent string.
pub(crate) const SPECIAL_NULL: u8 = 1;

/// Decoded length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LengthPrefix {
    /// A payload of this many bytes follows.
    Length(u32),
    /// A five-bit marker with no payload.
    Special(u8),
}

impl LengthPrefix {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let lead = read_byte(reader)?;
        match lead {
            0..=191 => Ok(Self::Length(u32::from(lead))),
            192..=223 => {
                let next = read_byte(reader)?;
                let high = u32::from(lead - TWO_BYTE_BASE) << 8;
                Ok(Self::Length(high + u32::from(next) + ONE_BYTE_LIMIT + 1))
            }
            224..=254 => Ok(Self::Special(lead & 0x1F)),
            255 => {
                let mut bytes = [0_u8; 4];
                reader.read_exact(&mut bytes)?;
                Ok(Self::Length(u32::from_be_bytes(bytes)))
            }
        }
    }

    pub(crate) fn write_to<W: Write>(self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Special(marker) => writer.write_all(&[SPECIAL_BASE | (marker & 0x1F)]),
            Self::Length(length) if length > TWO_BYTE_LIMIT => {
                let [a, b, c, d] = length.to_be_bytes();
                writer.write_all(&[FOUR_BYTE_MARKER, a, b, c, d])
            }
            Self::Length(length) if length > ONE_BYTE_LIMIT => {
                let [_, _, high, low] = (length - (ONE_BYTE_LIMIT + 1)).to_be_bytes();
                writer.write_all(&[TWO_BYTE_BASE + high, low])
            }
            Self::Length(length) => {
                let [_, _, _, low] = length.to_be_bytes();
                writer.write_all(&[low])
            }
        }
    }
}

fn read_byte<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut byte = [0_u8; 1];
    reader.read_exact(&mut byte)?;
    let [value] = byte;
    Ok(value)
}
