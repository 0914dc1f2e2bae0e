// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{IoDevice, SeekFrom};

/// A growable, in-memory [`IoDevice`] backed by a `Vec<u8>`.
///
/// Ported from the original implementation's `Buffer` device: reads and
/// writes operate at a cursor that can be seeked anywhere, writes past the
/// current end grow the buffer (zero-filling the gap), and the whole
/// contents can be taken out without copying via [`BufferDevice::take`].
#[derive(Clone, Debug, Default)]
pub struct BufferDevice {
    bytes: Vec<u8>,
    pos: usize,
}

impl BufferDevice {
    /// Creates an empty buffer device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer device pre-sized to `size` zero bytes.
    #[must_use]
    pub fn with_size(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
            pos: 0,
        }
    }

    /// Wraps existing bytes, with the cursor at the start.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Returns the buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Moves the buffer contents out, leaving this device empty with the
    /// cursor reset to zero.
    pub fn take(&mut self) -> Vec<u8> {
        self.pos = 0;
        std::mem::take(&mut self.bytes)
    }

    /// Reserves capacity for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    /// Empties the buffer and resets the cursor.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.pos = 0;
    }
}

impl IoDevice for BufferDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let available = self.bytes.len().saturating_sub(self.pos);
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let end = self.pos + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn pos(&mut self) -> std::io::Result<u64> {
        Ok(self.pos as u64)
    }

    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.bytes.len() as i64 + delta,
        };
        let target = target.max(0) as usize;
        self.pos = target;
        Ok(target as u64)
    }

    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn resize(&mut self, new_size: u64) -> std::io::Result<()> {
        self.bytes.resize(new_size as usize, 0);
        if self.pos > self.bytes.len() {
            self.pos = self.bytes.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_grows_and_read_back() {
        let mut dev = BufferDevice::new();
        dev.write_full(b"hello world").unwrap();
        dev.seek(SeekFrom::Start(0)).unwrap();
        let mut out = [0u8; 5];
        dev.read_full(&mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let mut dev = BufferDevice::new();
        dev.seek(SeekFrom::Start(4)).unwrap();
        dev.write_full(b"x").unwrap();
        assert_eq!(dev.as_slice(), &[0, 0, 0, 0, b'x']);
    }

    #[test]
    fn take_empties_and_resets_cursor() {
        let mut dev = BufferDevice::new();
        dev.write_full(b"data").unwrap();
        let taken = dev.take();
        assert_eq!(taken, b"data");
        assert_eq!(dev.size().unwrap(), 0);
        assert_eq!(dev.pos().unwrap(), 0);
    }
}
