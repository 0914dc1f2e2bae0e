// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Random-access I/O device abstraction.
//!
//! [`IoDevice`] is the seam every other component in this crate is built
//! on: the block-file backend, the packed archive writer/reader, and the
//! typed data stream all talk to storage only through this trait, so the
//! same algorithms work whether the backing store is an on-disk file, a
//! growable in-memory buffer, or a read-only view over bytes someone else
//! owns.

mod buffer;
mod external;
mod file;

pub use buffer::BufferDevice;
pub use external::ExternalBufferDevice;
pub use file::FileDevice;

/// Where a [`IoDevice::seek`] offset is measured from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekFrom {
    /// From the start of the device.
    Start(u64),
    /// From the current position; may be negative.
    Current(i64),
    /// From the end of the device; typically negative or zero.
    End(i64),
}

/// Access mode a device was opened with.
///
/// Mirrors a small bitflag set (`Read`, `Write`, `Append`, `Truncate`)
/// rather than pulling in a dedicated bitflags dependency for four bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AccessMode(u8);

impl AccessMode {
    /// No access; a closed device.
    pub const CLOSED: Self = Self(0x0);
    /// Readable.
    pub const READ: Self = Self(0x1);
    /// Writable.
    pub const WRITE: Self = Self(0x2);
    /// Readable and writable.
    pub const READ_WRITE: Self = Self(0x3);
    /// Writes append rather than overwrite at the current position.
    pub const APPEND: Self = Self(0x4);
    /// The device is truncated to empty on open.
    pub const TRUNCATE: Self = Self(0x8);

    /// Combines two modes.
    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns whether `self` contains all bits of `other`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns whether the mode permits reading.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READ)
    }

    /// Returns whether the mode permits writing.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl std::ops::BitOr for AccessMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.or(rhs)
    }
}

/// A random-access, seekable I/O device.
///
/// Default method bodies (`read_full`, `write_full`, the `*_absolute`
/// variants, `at_end`, `size`) are provided here exactly as the original
/// C++ `IODevice` base class provides them, so concrete devices only need
/// to override what actually differs for their backing store.
pub trait IoDevice {
    /// Reads up to `buf.len()` bytes, returning the number actually read
    /// (which may be less than `buf.len()`, including zero at EOF).
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Writes up to `buf.len()` bytes, returning the number actually
    /// written.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// Returns the current position.
    fn pos(&mut self) -> std::io::Result<u64>;

    /// Moves the current position.
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64>;

    /// Returns the total size of the device.
    fn size(&mut self) -> std::io::Result<u64> {
        let current = self.pos()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(current))?;
        Ok(end)
    }

    /// Grows or shrinks the device to exactly `new_size` bytes.
    ///
    /// Devices that cannot resize (e.g. a read-only view) should return an
    /// `Unsupported` error.
    fn resize(&mut self, _new_size: u64) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "device does not support resizing",
        ))
    }

    /// Flushes any buffered state to the backing store. Default is a
    /// no-op, matching devices with no write buffering of their own.
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Returns whether the current position is at the end of readable
    /// data.
    fn at_end(&mut self) -> std::io::Result<bool> {
        Ok(self.pos()? >= self.size()?)
    }

    /// Reads exactly `buf.len()` bytes, returning an `UnexpectedEof` error
    /// if the device runs out first.
    fn read_full(&mut self, mut buf: &mut [u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            let n = self.read(buf)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "device ended before the requested amount was read",
                ));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Writes exactly `buf.len()` bytes, returning a `WriteZero` error if
    /// the device stops accepting data first.
    fn write_full(&mut self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "device stopped accepting data before the full amount was written",
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes from an absolute offset, leaving the
    /// current position unchanged afterwards.
    ///
    /// The default implementation saves the position, seeks, reads, then
    /// restores the position; it is not safe to call concurrently with
    /// other operations on the same device without external synchronization.
    fn read_full_absolute(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let saved = self.pos()?;
        self.seek(SeekFrom::Start(offset))?;
        let result = self.read_full(buf);
        self.seek(SeekFrom::Start(saved))?;
        result
    }

    /// Writes exactly `buf.len()` bytes at an absolute offset, leaving the
    /// current position unchanged afterwards. Same caveats as
    /// [`IoDevice::read_full_absolute`].
    fn write_full_absolute(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        let saved = self.pos()?;
        self.seek(SeekFrom::Start(offset))?;
        let result = self.write_full(buf);
        self.seek(SeekFrom::Start(saved))?;
        result
    }
}
