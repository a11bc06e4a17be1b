//! Two's-complement 24-bit and 16-bit field codecs
//!
//! Channel samples travel as 3-byte signed integers, accelerometer axes as
//! 2-byte signed integers. Firmware revisions disagree on byte order, so both
//! orders are exposed explicitly and selected by configuration.

use serde::{Deserialize, Serialize};

/// Smallest value representable in 24 bits
pub const I24_MIN: i32 = -(1 << 23);
/// Largest value representable in 24 bits
pub const I24_MAX: i32 = (1 << 23) - 1;

const SIGN_BIT_24: u32 = 0x0080_0000;
const UPPER_BYTE: u32 = 0xFF00_0000;
const LOW_24: u32 = 0x00FF_FFFF;

/// Decode a big-endian 24-bit two's-complement field
pub fn i24_from_be_bytes(bytes: [u8; 3]) -> i32 {
    let x = (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
    sign_extend_24(x)
}

/// Decode a little-endian 24-bit two's-complement field
pub fn i24_from_le_bytes(bytes: [u8; 3]) -> i32 {
    i24_from_be_bytes([bytes[2], bytes[1], bytes[0]])
}

/// Encode the low 24 bits of `value` big-endian
pub fn i24_to_be_bytes(value: i32) -> [u8; 3] {
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Encode the low 24 bits of `value` little-endian
pub fn i24_to_le_bytes(value: i32) -> [u8; 3] {
    let [a, b, c] = i24_to_be_bytes(value);
    [c, b, a]
}

fn sign_extend_24(x: u32) -> i32 {
    if x & SIGN_BIT_24 != 0 {
        (x | UPPER_BYTE) as i32
    } else {
        (x & LOW_24) as i32
    }
}

/// Decode a big-endian 16-bit two's-complement field
pub fn i16_from_be_bytes(bytes: [u8; 2]) -> i16 {
    i16::from_be_bytes(bytes)
}

/// Decode a little-endian 16-bit two's-complement field
pub fn i16_from_le_bytes(bytes: [u8; 2]) -> i16 {
    i16::from_le_bytes(bytes)
}

/// Byte order of multi-byte fields inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Most significant byte first (current firmware)
    #[default]
    BigEndian,
    /// Least significant byte first (early firmware)
    LittleEndian,
}

impl ByteOrder {
    /// Decode a 24-bit field in this byte order
    pub fn read_i24(self, bytes: [u8; 3]) -> i32 {
        match self {
            ByteOrder::BigEndian => i24_from_be_bytes(bytes),
            ByteOrder::LittleEndian => i24_from_le_bytes(bytes),
        }
    }

    /// Encode a 24-bit field in this byte order
    pub fn write_i24(self, value: i32) -> [u8; 3] {
        match self {
            ByteOrder::BigEndian => i24_to_be_bytes(value),
            ByteOrder::LittleEndian => i24_to_le_bytes(value),
        }
    }

    /// Decode a 16-bit field in this byte order
    pub fn read_i16(self, bytes: [u8; 2]) -> i16 {
        match self {
            ByteOrder::BigEndian => i16_from_be_bytes(bytes),
            ByteOrder::LittleEndian => i16_from_le_bytes(bytes),
        }
    }

    /// Encode a 16-bit field in this byte order
    pub fn write_i16(self, value: i16) -> [u8; 2] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }
}
