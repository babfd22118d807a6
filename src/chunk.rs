//! # Chunk
//!
//! Byte sequences used as patch patterns and replacements.
//!
//! Patterns are written as hex strings (`"0F 8E 32 01 00 00"`), replacements are either hex strings
//! or built at runtime from typed values with [`Chunk::append`].

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use thiserror::Error;

/// Opcode of the single-byte x86 `nop`
pub const NOP: u8 = 0x90;

/// Errors when parsing a hex pattern
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The pattern has an odd number of hex digits once whitespace is removed
    #[error("pattern has an odd number of hex digits ({0})")]
    OddLength(usize),
    /// A whitespace-separated group is not exactly two hex digits
    #[error("invalid hex group {group:?} at position {index}")]
    InvalidGroup {
        /// Index of the group inside the pattern
        index: usize,
        /// The offending group
        group: String,
    },
}

/// Values that can be appended to a [`Chunk`] in their in-memory representation
pub trait NativeBytes: Copy {
    /// Array holding the representation of the value
    type Bytes: AsRef<[u8]>;

    /// Returns the bytes of the value exactly as they are laid out in memory
    fn native_bytes(self) -> Self::Bytes;
}

/// Implements [`NativeBytes`] for primitives through their `to_ne_bytes`
macro_rules! impl_native_bytes {
    ($($ty:ty),* $(,)?) => {
        $(
            impl NativeBytes for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn native_bytes(self) -> Self::Bytes {
                    self.to_ne_bytes()
                }
            }
        )*
    };
}

impl_native_bytes!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, f32, f64);

/// An ordered, growable sequence of raw bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// Bytes of the chunk
    data: Vec<u8>,
}

impl Chunk {
    /// Creates an empty chunk
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chunk of `len` `nop` instructions
    pub fn nops(len: usize) -> Self {
        Self {
            data: vec![NOP; len],
        }
    }

    /// Parses a hex pattern such as `"C3 90 90 90"`.
    ///
    /// Groups are separated by whitespace and must be exactly two hex digits each.
    ///
    /// ```
    /// use rtpatch::chunk::Chunk;
    ///
    /// let chunk = Chunk::from_hex("31 C0 40 C3").unwrap();
    /// assert_eq!(&chunk[..], &[0x31, 0xC0, 0x40, 0xC3]);
    /// ```
    pub fn from_hex(pattern: &str) -> Result<Self, ParseError> {
        let digits = pattern.chars().filter(|c| !c.is_whitespace()).count();
        if digits % 2 != 0 {
            return Err(ParseError::OddLength(digits));
        }

        let data = pattern
            .split_whitespace()
            .enumerate()
            .map(|(index, group)| {
                let valid = group.len() == 2 && group.chars().all(|c| c.is_ascii_hexdigit());
                if !valid {
                    return Err(ParseError::InvalidGroup {
                        index,
                        group: group.to_string(),
                    });
                }
                u8::from_str_radix(group, 16).map_err(|_| ParseError::InvalidGroup {
                    index,
                    group: group.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { data })
    }

    /// Formats the chunk as uppercase hex, one space between bytes
    pub fn to_hex(&self) -> String {
        to_hex(&self.data)
    }

    /// Appends the in-memory representation of `value`.
    ///
    /// Calls can be chained; values end up in the order they were appended.
    ///
    /// ```
    /// use rtpatch::chunk::Chunk;
    ///
    /// let mut chunk = Chunk::new();
    /// chunk.append(0xE8u8).append(0x2FFBi32);
    /// assert_eq!(chunk.to_hex(), "E8 FB 2F 00 00");
    /// ```
    pub fn append<T: NativeBytes>(&mut self, value: T) -> &mut Self {
        self.data.extend_from_slice(value.native_bytes().as_ref());
        self
    }

    /// Appends raw bytes
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Empties the chunk, keeping its allocation for reuse
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Returns the bytes of the chunk
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the chunk, returning its bytes
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Formats bytes as uppercase hex, one space between bytes and no trailing space
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl From<&[u8]> for Chunk {
    fn from(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

impl<const N: usize> From<[u8; N]> for Chunk {
    fn from(data: [u8; N]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

impl FromStr for Chunk {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunk, ParseError};

    #[test]
    /// Hex strings survive a parse/format cycle, including the empty pattern
    fn test_hex_roundtrip() {
        for pattern in ["", "00", "C3 90 90 90", "0F 8E 32 01 00 00", "FF 00 7F 80"] {
            let chunk = Chunk::from_hex(pattern).unwrap();
            assert_eq!(chunk.to_hex(), pattern);
            assert_eq!(Chunk::from_hex(&chunk.to_hex()).unwrap(), chunk);
        }

        let every_byte = Chunk::from((0..=255u8).collect::<Vec<_>>());
        assert_eq!(Chunk::from_hex(&every_byte.to_hex()).unwrap(), every_byte);
    }

    #[test]
    /// Parsing is lenient about case and whitespace, formatting is not
    fn test_lenient_parse() {
        let chunk: Chunk = "  c3\t90\n9a ff ".parse().unwrap();
        assert_eq!(chunk.as_slice(), &[0xC3, 0x90, 0x9A, 0xFF]);
        assert_eq!(chunk.to_string(), "C3 90 9A FF");
    }

    #[test]
    /// Malformed patterns are rejected
    fn test_parse_errors() {
        assert_eq!(Chunk::from_hex("C3 9"), Err(ParseError::OddLength(3)));
        assert_eq!(
            Chunk::from_hex("C39 0"),
            Err(ParseError::InvalidGroup {
                index: 0,
                group: "C39".to_string()
            })
        );
        assert_eq!(
            Chunk::from_hex("C3 G0"),
            Err(ParseError::InvalidGroup {
                index: 1,
                group: "G0".to_string()
            })
        );
        assert!(Chunk::from_hex("0x90").is_err());
        assert!(Chunk::from_hex("+1 00").is_err());
    }

    #[test]
    /// Appended values keep their order and native layout
    fn test_append() {
        let mut chunk = Chunk::new();
        chunk.append(1024i32).append(768i32);
        assert_eq!(chunk.to_hex(), "00 04 00 00 00 03 00 00");

        chunk.clear();
        assert!(chunk.is_empty());

        chunk.append(800i16).append(-1i8).append(1.0f32);
        assert_eq!(chunk.to_hex(), "20 03 FF 00 00 80 3F");
    }

    #[test]
    /// `nop` fills match the requested length
    fn test_nops() {
        assert_eq!(Chunk::nops(6).to_hex(), "90 90 90 90 90 90");
        assert!(Chunk::nops(0).is_empty());
    }
}
