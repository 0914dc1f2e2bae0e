// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{IoDevice, SeekFrom};

/// A read-only [`IoDevice`] view over bytes owned elsewhere.
///
/// Ported from the original implementation's `ExternalBuffer`: any write
/// attempt fails, and seeking/reading behaves exactly like
/// [`super::BufferDevice`] over a borrowed slice instead of an owned one.
#[derive(Clone, Copy, Debug)]
pub struct ExternalBufferDevice<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ExternalBufferDevice<'a> {
    /// Creates a view over `bytes`, with the cursor at the start.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Returns the number of unread bytes remaining from the cursor to the
    /// end.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}

impl IoDevice for ExternalBufferDevice<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "external buffer devices are read-only",
        ))
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
        let target = target.clamp(0, self.bytes.len() as i64) as usize;
        self.pos = target;
        Ok(target as u64)
    }

    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_clamped_to_available_bytes() {
        let data = b"abcdef";
        let mut dev = ExternalBufferDevice::new(data);
        let mut out = [0u8; 10];
        let n = dev.read(&mut out).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&out[..6], data);
    }

    #[test]
    fn write_always_fails() {
        let data = b"abc";
        let mut dev = ExternalBufferDevice::new(data);
        assert!(dev.write(b"x").is_err());
    }

    #[test]
    fn seek_clamps_to_bounds() {
        let data = b"abc";
        let mut dev = ExternalBufferDevice::new(data);
        dev.seek(SeekFrom::End(100)).unwrap();
        assert_eq!(dev.pos().unwrap(), 3);
        dev.seek(SeekFrom::Current(-100)).unwrap();
        assert_eq!(dev.pos().unwrap(), 0);
    }
}
