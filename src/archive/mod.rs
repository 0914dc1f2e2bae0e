// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Packed asset archive: a single-file, sorted, path-addressable container
//! built once from an [`AssetSource`](source::AssetSource) and read back
//! many times.
//!
//! File layout: an 8-byte magic, an 8-byte pointer to the index, the raw
//! asset blobs back to back, then the index itself (a magic, a JSON
//! metadata blob, and a sorted path -> `(offset, size)` map). Everything is
//! framed with the same [`DataStream`] primitives the B+ tree block store
//! uses, just without any block structure: the archive is written once,
//! start to finish, and never mutated in place.

pub mod source;

use crate::{
    device::{IoDevice, SeekFrom},
    stream::DataStream,
    Error, Result,
};
use source::AssetSource;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

const MAGIC: &[u8] = b"SBAsset6";
const INDEX_MAGIC: &[u8] = b"INDEX";

/// Controls how asset paths are ordered within the built archive.
///
/// Assets are grouped by extension before being written, so that files
/// likely to be read together (e.g. all images, or all in a particular
/// data format) end up physically adjacent. Extensions not named in
/// `extension_sorting` sort after all named ones, in lexical path order.
#[derive(Clone, Debug, Default)]
pub struct ArchiveBuildConfig {
    extension_sorting: Vec<String>,
}

impl ArchiveBuildConfig {
    /// Sets the extension priority list (case-insensitive, without the
    /// leading `.`). Earlier entries sort first.
    #[must_use]
    pub fn with_extension_sorting(mut self, extensions: impl IntoIterator<Item = String>) -> Self {
        self.extension_sorting = extensions.into_iter().map(|e| e.to_lowercase()).collect();
        self
    }

    fn ordering_value(&self, path: &str) -> (usize, String) {
        let extension = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        let position = self
            .extension_sorting
            .iter()
            .position(|e| *e == extension)
            .unwrap_or(self.extension_sorting.len());
        (position, path.to_lowercase())
    }
}

/// Builds a packed archive from `source` into `device`, which must support
/// writing and is positioned at offset 0 on return.
pub fn build<D: IoDevice>(device: &mut D, source: &impl AssetSource, config: &ArchiveBuildConfig) -> Result<()> {
    device.seek(SeekFrom::Start(0))?;

    let mut paths = source.asset_paths()?;
    paths.sort_by(|a, b| config.ordering_value(a).cmp(&config.ordering_value(b)));

    let mut index: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    {
        let mut ds = DataStream::new(device);
        ds.write_raw(MAGIC)?;
        ds.write_u64(0)?; // patched with the real index offset below

        for path in &paths {
            let contents = source.read(path)?;
            let offset = ds.pos()?;
            index.insert(path.clone(), (offset, contents.len() as u64));
            ds.write_raw(&contents)?;
        }

        let index_start = ds.pos()?;
        ds.write_raw(INDEX_MAGIC)?;

        let metadata = serde_json::to_string(source.metadata())
            .map_err(|e| Error::InvalidArgument { message: format!("metadata is not valid JSON: {e}") })?;
        ds.write_str(&metadata)?;

        let entries: Vec<(String, (u64, u64))> = index.into_iter().collect();
        ds.write_map_container(
            &entries,
            |ds, path| ds.write_str(path),
            |ds, (offset, size)| {
                ds.write_u64(*offset)?;
                ds.write_u64(*size)
            },
        )?;

        ds.seek(SeekFrom::Start(8))?;
        ds.write_u64(index_start)?;
    }
    device.seek(SeekFrom::Start(0))?;
    Ok(())
}

/// Read-only, random-access view over a built packed archive.
///
/// Cloning an [`ArchiveReader`] (via [`ArchiveReader::clone`]) shares the
/// same underlying device, so readers returned by [`ArchiveReader::open`]
/// may outlive the [`ArchiveReader`] they were opened from, as long as one
/// clone of it remains alive.
pub struct ArchiveReader<D: IoDevice> {
    device: Arc<Mutex<D>>,
    metadata: serde_json::Value,
    index: BTreeMap<String, (u64, u64)>,
}

impl<D: IoDevice> Clone for ArchiveReader<D> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            metadata: self.metadata.clone(),
            index: self.index.clone(),
        }
    }
}

impl<D: IoDevice> ArchiveReader<D> {
    /// Opens a packed archive previously written by [`build`].
    pub fn open(device: D) -> Result<Self> {
        let mut device = device;
        let (metadata, index) = {
            let mut ds = DataStream::new(&mut device);
            let magic = ds.read_raw(MAGIC.len())?;
            if magic != MAGIC {
                return Err(Error::Format { context: "packed archive magic" });
            }
            let index_start = ds.read_u64()?;

            ds.seek(SeekFrom::Start(index_start))?;
            let index_magic = ds.read_raw(INDEX_MAGIC.len())?;
            if index_magic != INDEX_MAGIC {
                return Err(Error::Format { context: "packed archive index magic" });
            }

            let metadata_json = ds.read_str()?;
            let metadata: serde_json::Value = serde_json::from_str(&metadata_json)
                .map_err(|_| Error::Format { context: "packed archive metadata" })?;

            let entries: Vec<(String, (u64, u64))> = ds.read_map_container(
                |ds| ds.read_str(),
                |ds| {
                    let offset = ds.read_u64()?;
                    let size = ds.read_u64()?;
                    Ok((offset, size))
                },
            )?;
            (metadata, entries.into_iter().collect())
        };

        Ok(Self {
            device: Arc::new(Mutex::new(device)),
            metadata,
            index,
        })
    }

    fn locate(&self, path: &str) -> Result<(u64, u64)> {
        self.index
            .get(path)
            .copied()
            .ok_or_else(|| Error::InvalidArgument {
                message: format!("requested file '{path}' does not exist in the packed assets file"),
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, D> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: IoDevice> AssetSource for ArchiveReader<D> {
    fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }

    fn asset_paths(&self) -> Result<Vec<String>> {
        Ok(self.index.keys().cloned().collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn IoDevice + Send>> {
        let (offset, size) = self.locate(path)?;
        Ok(Box::new(AssetReader {
            device: Arc::clone(&self.device),
            offset,
            size,
            pos: 0,
        }))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (offset, size) = self.locate(path)?;
        let mut buf = vec![0u8; usize::try_from(size).unwrap_or(usize::MAX)];
        self.lock().read_full_absolute(offset, &mut buf)?;
        Ok(buf)
    }
}

/// A read-only [`IoDevice`] over a single asset's bytes within a shared
/// archive file, as returned by [`ArchiveReader::open`].
///
/// Reads are absolute and clamped to `[0, size)` against the archive's
/// offset for this asset; the cursor of the shared underlying device is
/// preserved across the call.
pub struct AssetReader<D: IoDevice> {
    device: Arc<Mutex<D>>,
    offset: u64,
    size: u64,
    pos: u64,
}

impl<D: IoDevice> IoDevice for AssetReader<D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        let len = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
        if len == 0 {
            return Ok(0);
        }
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        device.read_full_absolute(self.offset + self.pos, &mut buf[..len])?;
        self.pos += len as u64;
        Ok(len)
    }

    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "archive asset readers are read-only",
        ))
    }

    fn pos(&mut self) -> std::io::Result<u64> {
        Ok(self.pos)
    }

    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.size) + i128::from(delta),
        };
        let clamped = target.clamp(0, i128::from(self.size));
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        {
            self.pos = clamped as u64;
        }
        Ok(self.pos)
    }

    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.size)
    }

    fn at_end(&mut self) -> std::io::Result<bool> {
        Ok(self.pos >= self.size)
    }
}
