// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{AccessMode, IoDevice, SeekFrom};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, Write},
    path::Path,
};

/// A filesystem-backed [`IoDevice`].
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    mode: AccessMode,
}

impl FileDevice {
    /// Opens (or creates) `path` with the given access mode.
    pub fn open(path: &Path, mode: AccessMode) -> std::io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(mode.is_readable()).write(mode.is_writable());

        if mode.contains(AccessMode::WRITE) {
            options.create(true);
        }
        if mode.contains(AccessMode::TRUNCATE) {
            options.truncate(true);
        }
        if mode.contains(AccessMode::APPEND) {
            options.append(true);
        }

        let file = options.open(path)?;
        Ok(Self { file, mode })
    }

    /// Wraps an already-open [`File`], assumed to be read-only.
    ///
    /// Used by [`crate::archive::source::DirectoryAssetSource`], which opens
    /// files through the pluggable [`crate::fs::FileSystem`] trait rather
    /// than through [`FileDevice::open`] directly.
    #[must_use]
    pub fn from_file(file: File) -> Self {
        Self { file, mode: AccessMode::READ }
    }

    /// Returns the access mode this device was opened with.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

impl IoDevice for FileDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn pos(&mut self) -> std::io::Result<u64> {
        self.file.stream_position()
    }

    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let std_pos = match pos {
            SeekFrom::Start(p) => std::io::SeekFrom::Start(p),
            SeekFrom::Current(d) => std::io::SeekFrom::Current(d),
            SeekFrom::End(d) => std::io::SeekFrom::End(d),
        };
        self.file.seek(std_pos)
    }

    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn resize(&mut self, new_size: u64) -> std::io::Result<()> {
        self.file.set_len(new_size)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn write_read_round_trip_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.bin");

        {
            let mut dev = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
            dev.write_full(b"payload").unwrap();
            dev.sync().unwrap();
        }

        let mut dev = FileDevice::open(&path, AccessMode::READ).unwrap();
        let mut buf = [0u8; 7];
        dev.read_full(&mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }
}
