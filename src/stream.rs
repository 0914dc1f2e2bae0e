// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Typed serialization over any [`IoDevice`].
//!
//! Collapses the original implementation's family of
//! `DataStreamIODevice`/`DataStreamBuffer`/`DataStreamFunctions` classes
//! into a single type generic over the device, since Rust's trait objects
//! and generics remove the need for a class hierarchy per backing store.

use crate::{
    byte_order::{self, ByteOrder},
    coding::DecodeError,
    device::IoDevice,
    vlq,
};

/// How string and byte-array lengths are framed on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum StringFraming {
    /// A VLQ-encoded length prefix followed by the raw bytes.
    #[default]
    LengthPrefixed,
    /// Raw bytes followed by a single `0x00` terminator byte. The string
    /// itself must not contain an embedded NUL.
    NulTerminated,
}

/// A typed read/write cursor over an [`IoDevice`].
pub struct DataStream<'d, D: IoDevice> {
    device: &'d mut D,
    byte_order: ByteOrder,
    framing: StringFraming,
}

impl<'d, D: IoDevice> DataStream<'d, D> {
    /// Wraps `device` with the default big-endian, length-prefixed
    /// configuration.
    pub fn new(device: &'d mut D) -> Self {
        Self {
            device,
            byte_order: ByteOrder::BigEndian,
            framing: StringFraming::LengthPrefixed,
        }
    }

    /// Overrides the byte order used for fixed-width integers.
    #[must_use]
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Overrides how strings and byte arrays are framed.
    #[must_use]
    pub fn with_framing(mut self, framing: StringFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Returns the current device position.
    pub fn pos(&mut self) -> std::io::Result<u64> {
        self.device.pos()
    }

    /// Seeks the underlying device.
    pub fn seek(&mut self, pos: crate::device::SeekFrom) -> std::io::Result<u64> {
        self.device.seek(pos)
    }

    /// Returns whether the device is at the end of readable data.
    pub fn at_end(&mut self) -> std::io::Result<bool> {
        self.device.at_end()
    }

    /// Writes raw bytes with no framing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.device.write_full(bytes)
    }

    /// Reads exactly `len` raw bytes with no framing.
    pub fn read_raw(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.device.read_full(&mut buf)?;
        Ok(buf)
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) -> std::io::Result<()> {
        byte_order::write_u8(&mut IoDeviceWriter(self.device), value)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> std::io::Result<u8> {
        byte_order::read_u8(&mut IoDeviceReader(self.device))
    }

    /// Writes a big/little/native-endian `u16` per the stream's byte order.
    pub fn write_u16(&mut self, value: u16) -> std::io::Result<()> {
        byte_order::write_u16(&mut IoDeviceWriter(self.device), value, self.byte_order)
    }

    /// Reads a `u16` per the stream's byte order.
    pub fn read_u16(&mut self) -> std::io::Result<u16> {
        byte_order::read_u16(&mut IoDeviceReader(self.device), self.byte_order)
    }

    /// Writes a `u32` per the stream's byte order.
    pub fn write_u32(&mut self, value: u32) -> std::io::Result<()> {
        byte_order::write_u32(&mut IoDeviceWriter(self.device), value, self.byte_order)
    }

    /// Reads a `u32` per the stream's byte order.
    pub fn read_u32(&mut self) -> std::io::Result<u32> {
        byte_order::read_u32(&mut IoDeviceReader(self.device), self.byte_order)
    }

    /// Writes a `u64` per the stream's byte order.
    pub fn write_u64(&mut self, value: u64) -> std::io::Result<()> {
        byte_order::write_u64(&mut IoDeviceWriter(self.device), value, self.byte_order)
    }

    /// Reads a `u64` per the stream's byte order.
    pub fn read_u64(&mut self) -> std::io::Result<u64> {
        byte_order::read_u64(&mut IoDeviceReader(self.device), self.byte_order)
    }

    /// Writes an unsigned VLQ integer.
    pub fn write_vlq_u(&mut self, value: u64) -> std::io::Result<()> {
        vlq::write_u(&mut IoDeviceWriter(self.device), value)
    }

    /// Reads an unsigned VLQ integer.
    pub fn read_vlq_u(&mut self) -> Result<u64, DecodeError> {
        vlq::read_u(&mut IoDeviceReader(self.device))
    }

    /// Writes a length-prefixed byte array (VLQ length, then raw bytes).
    pub fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_vlq_u(bytes.len() as u64)?;
        self.write_raw(bytes)
    }

    /// Reads a length-prefixed byte array.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_vlq_u()?;
        Ok(self.read_raw(len as usize)?)
    }

    /// Writes a UTF-8 string using the stream's configured framing.
    pub fn write_str(&mut self, value: &str) -> std::io::Result<()> {
        match self.framing {
            StringFraming::LengthPrefixed => self.write_bytes(value.as_bytes()),
            StringFraming::NulTerminated => {
                if value.as_bytes().contains(&0) {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "string contains an embedded NUL byte",
                    ));
                }
                self.write_raw(value.as_bytes())?;
                self.write_u8(0)
            }
        }
    }

    /// Reads a UTF-8 string using the stream's configured framing.
    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let bytes = match self.framing {
            StringFraming::LengthPrefixed => self.read_bytes()?,
            StringFraming::NulTerminated => {
                let mut bytes = Vec::new();
                loop {
                    let byte = self.read_u8()?;
                    if byte == 0 {
                        break;
                    }
                    bytes.push(byte);
                }
                bytes
            }
        };
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidLength("utf-8 string"))
    }

    /// Writes a homogeneous container, delegating each element to
    /// `write_elem`, preceded by a VLQ element count.
    pub fn write_container<T, F>(&mut self, items: &[T], mut write_elem: F) -> std::io::Result<()>
    where
        F: FnMut(&mut Self, &T) -> std::io::Result<()>,
    {
        self.write_vlq_u(items.len() as u64)?;
        for item in items {
            write_elem(self, item)?;
        }
        Ok(())
    }

    /// Reads a homogeneous container written by
    /// [`DataStream::write_container`].
    pub fn read_container<T, F>(&mut self, mut read_elem: F) -> Result<Vec<T>, DecodeError>
    where
        F: FnMut(&mut Self) -> Result<T, DecodeError>,
    {
        let len = self.read_vlq_u()?;
        let mut items = Vec::with_capacity(len.min(1 << 20) as usize);
        for _ in 0..len {
            items.push(read_elem(self)?);
        }
        Ok(items)
    }

    /// Writes a key/value map container: a VLQ entry count, then each
    /// `(key, value)` pair via the supplied closures.
    pub fn write_map_container<K, V, FK, FV>(
        &mut self,
        entries: &[(K, V)],
        mut write_key: FK,
        mut write_value: FV,
    ) -> std::io::Result<()>
    where
        FK: FnMut(&mut Self, &K) -> std::io::Result<()>,
        FV: FnMut(&mut Self, &V) -> std::io::Result<()>,
    {
        self.write_vlq_u(entries.len() as u64)?;
        for (k, v) in entries {
            write_key(self, k)?;
            write_value(self, v)?;
        }
        Ok(())
    }

    /// Reads a key/value map container written by
    /// [`DataStream::write_map_container`].
    pub fn read_map_container<K, V, FK, FV>(
        &mut self,
        mut read_key: FK,
        mut read_value: FV,
    ) -> Result<Vec<(K, V)>, DecodeError>
    where
        FK: FnMut(&mut Self) -> Result<K, DecodeError>,
        FV: FnMut(&mut Self) -> Result<V, DecodeError>,
    {
        let len = self.read_vlq_u()?;
        let mut entries = Vec::with_capacity(len.min(1 << 20) as usize);
        for _ in 0..len {
            let k = read_key(self)?;
            let v = read_value(self)?;
            entries.push((k, v));
        }
        Ok(entries)
    }
}

/// Adapts `&mut D` to `std::io::Write` so the `byteorder`/`vlq` helpers
/// (which are generic over `Read`/`Write`) can operate on a device.
struct IoDeviceWriter<'a, D: IoDevice>(&'a mut D);

impl<D: IoDevice> std::io::Write for IoDeviceWriter<'_, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Adapts `&mut D` to `std::io::Read`.
struct IoDeviceReader<'a, D: IoDevice>(&'a mut D);

impl<D: IoDevice> std::io::Read for IoDeviceReader<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}
