// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Byte order selection for multi-byte integers read from or written to a
//! [`crate::device::IoDevice`].
//!
//! All on-disk structures defined by this crate (file headers, block
//! headers, index/leaf records, packed archive metadata) use big-endian
//! encoding; [`ByteOrder::NoConversion`] exists for callers that have
//! already placed bytes in the right order and simply want to copy them
//! through the same read/write helpers.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Which byte order to apply when reading or writing multi-byte integers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ByteOrder {
    /// Most significant byte first (network order). The default, and the
    /// order used by every on-disk format this crate defines.
    #[default]
    BigEndian,

    /// Least significant byte first.
    LittleEndian,

    /// Bytes are copied verbatim with no reinterpretation.
    NoConversion,
}

macro_rules! rw_pair {
    ($read_name:ident, $write_name:ident, $ty:ty, $read_be:ident, $write_be:ident, $read_le:ident, $write_le:ident) => {
        /// Reads one value of this width using the given byte order.
        pub fn $read_name<R: Read>(reader: &mut R, order: ByteOrder) -> std::io::Result<$ty> {
            match order {
                ByteOrder::BigEndian => reader.$read_be::<BigEndian>(),
                ByteOrder::LittleEndian => reader.$read_le::<LittleEndian>(),
                ByteOrder::NoConversion => {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    reader.read_exact(&mut buf)?;
                    Ok(<$ty>::from_ne_bytes(buf))
                }
            }
        }

        /// Writes one value of this width using the given byte order.
        pub fn $write_name<W: Write>(
            writer: &mut W,
            value: $ty,
            order: ByteOrder,
        ) -> std::io::Result<()> {
            match order {
                ByteOrder::BigEndian => writer.$write_be::<BigEndian>(value),
                ByteOrder::LittleEndian => writer.$write_le::<LittleEndian>(value),
                ByteOrder::NoConversion => writer.write_all(&value.to_ne_bytes()),
            }
        }
    };
}

rw_pair!(read_u16, write_u16, u16, read_u16, write_u16, read_u16, write_u16);
rw_pair!(read_u32, write_u32, u32, read_u32, write_u32, read_u32, write_u32);
rw_pair!(read_u64, write_u64, u64, read_u64, write_u64, read_u64, write_u64);
rw_pair!(read_i16, write_i16, i16, read_i16, write_i16, read_i16, write_i16);
rw_pair!(read_i32, write_i32, i32, read_i32, write_i32, read_i32, write_i32);
rw_pair!(read_i64, write_i64, i64, read_i64, write_i64, read_i64, write_i64);

/// Reads a single byte; byte order has no effect at this width.
pub fn read_u8<R: Read>(reader: &mut R) -> std::io::Result<u8> {
    reader.read_u8()
}

/// Writes a single byte; byte order has no effect at this width.
pub fn write_u8<W: Write>(writer: &mut W, value: u8) -> std::io::Result<()> {
    writer.write_u8(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_big_endian() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x0102_0304, ByteOrder::BigEndian).unwrap();
        assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04]);
        let mut cursor = &buf[..];
        assert_eq!(read_u32(&mut cursor, ByteOrder::BigEndian).unwrap(), 0x0102_0304);
    }

    #[test]
    fn round_trip_little_endian() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 0x0102_0304_0506_0708, ByteOrder::LittleEndian).unwrap();
        let mut cursor = &buf[..];
        assert_eq!(
            read_u64(&mut cursor, ByteOrder::LittleEndian).unwrap(),
            0x0102_0304_0506_0708
        );
    }
}
