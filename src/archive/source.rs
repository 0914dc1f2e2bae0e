// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Abstract source of named byte blobs with metadata, and a directory-backed
//! implementation of it.
//!
//! Ported from the original implementation's `AssetSource` interface and
//! `DirectoryAssetSource`: a source can be a directory on a filesystem or a
//! packed archive (see [`super::ArchiveReader`]), and callers address either
//! one through the same trait.

use crate::{
    device::IoDevice,
    fs::{FileSystem, StdFileSystem},
    Error, Result,
};
use regex::Regex;
use std::{io::Write as _, marker::PhantomData, path::PathBuf};

/// An abstract source of named byte blobs with metadata attached.
///
/// A source could be a directory on a filesystem, where assets are pulled
/// directly from files, or a packed archive, where assets are pulled from
/// the correct region of a single file.
pub trait AssetSource {
    /// Arbitrary metadata attached to this source as a whole.
    fn metadata(&self) -> &serde_json::Value;

    /// All asset paths currently available in this source.
    fn asset_paths(&self) -> Result<Vec<String>>;

    /// Opens `path` for streaming, random-access reads.
    fn open(&self, path: &str) -> Result<Box<dyn IoDevice + Send>>;

    /// Reads the entirety of `path` into memory.
    fn read(&self, path: &str) -> Result<Vec<u8>>;
}

const METADATA_CANDIDATES: [&str; 2] = ["/_metadata", "/.metadata"];

/// An [`AssetSource`] backed by a plain directory tree on a filesystem.
///
/// Asset paths are absolute, `/`-separated logical paths rooted at the
/// source's base directory. A metadata file named `/_metadata` (preferred)
/// or `/.metadata`, if present, is loaded as JSON at construction time and
/// is itself never enumerated as an asset.
pub struct DirectoryAssetSource<FS: FileSystem = StdFileSystem> {
    base_directory: PathBuf,
    ignore_patterns: Vec<Regex>,
    metadata_file: Option<String>,
    metadata: serde_json::Value,
    asset_paths: Vec<String>,
    _fs: PhantomData<FS>,
}

impl<FS: FileSystem> DirectoryAssetSource<FS> {
    /// Scans `base_directory`, ignoring any asset whose logical path
    /// matches one of `ignore_patterns` (in addition to the always-ignored
    /// metadata file paths).
    pub fn open(base_directory: impl Into<PathBuf>, ignore_patterns: &[String]) -> Result<Self> {
        let base_directory = base_directory.into();

        let mut metadata_file = None;
        let mut metadata = serde_json::Value::Object(serde_json::Map::new());
        for candidate in METADATA_CANDIDATES {
            let fs_path = Self::to_filesystem_path(&base_directory, candidate)?;
            if FS::exists(&fs_path)? {
                let contents = FS::read_to_string(&fs_path)?;
                metadata = serde_json::from_str(&contents)
                    .map_err(|e| Error::InvalidArgument { message: format!("could not load metadata file '{candidate}': {e}") })?;
                metadata_file = Some(candidate.to_string());
                break;
            }
        }

        let mut patterns = Vec::with_capacity(ignore_patterns.len() + 2);
        for pattern in ignore_patterns.iter().map(String::as_str).chain(["^/_metadata$", "^/\\.metadata$"]) {
            patterns.push(Regex::new(pattern).map_err(|e| Error::InvalidArgument {
                message: format!("invalid ignore pattern '{pattern}': {e}"),
            })?);
        }

        let mut source = Self {
            base_directory,
            ignore_patterns: patterns,
            metadata_file,
            metadata,
            asset_paths: Vec::new(),
            _fs: PhantomData,
        };

        let mut paths = Vec::new();
        source.scan_all("/", &mut paths)?;
        paths.sort_unstable();
        source.asset_paths = paths;

        Ok(source)
    }

    /// Converts an absolute logical asset path to its location on the
    /// underlying filesystem.
    pub fn to_filesystem(&self, path: &str) -> Result<PathBuf> {
        Self::to_filesystem_path(&self.base_directory, path)
    }

    fn to_filesystem_path(base_directory: &std::path::Path, path: &str) -> Result<PathBuf> {
        let relative = path.strip_prefix('/').ok_or_else(|| Error::InvalidArgument {
            message: format!("asset path '{path}' must be absolute"),
        })?;
        Ok(base_directory.join(relative))
    }

    fn should_ignore(&self, asset_path: &str) -> bool {
        self.ignore_patterns.iter().any(|pattern| pattern.is_match(asset_path))
    }

    fn scan_all(&self, asset_directory: &str, output: &mut Vec<String>) -> Result<()> {
        let fs_directory = self.to_filesystem(asset_directory)?;
        for entry in FS::read_dir(&fs_directory)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let asset_path = format!("{asset_directory}{name}");
            if entry.is_dir() {
                self.scan_all(&format!("{asset_path}/"), output)?;
            } else if !self.should_ignore(&asset_path) {
                output.push(asset_path);
            }
        }
        Ok(())
    }

    /// Replaces this source's metadata, writing it to `/_metadata` (the
    /// default if no metadata file was previously loaded) if it changed.
    /// An empty metadata object deletes the file instead of writing it.
    pub fn set_metadata(&mut self, metadata: serde_json::Value) -> Result<()> {
        if metadata == self.metadata {
            return Ok(());
        }

        let metadata_file = self.metadata_file.get_or_insert_with(|| "/_metadata".to_string()).clone();
        self.metadata = metadata;
        let fs_path = self.to_filesystem(&metadata_file)?;

        let is_empty = matches!(&self.metadata, serde_json::Value::Object(map) if map.is_empty())
            || matches!(&self.metadata, serde_json::Value::Null);
        if is_empty {
            if FS::exists(&fs_path)? {
                FS::remove_file(&fs_path)?;
            }
        } else {
            let rendered = serde_json::to_string_pretty(&self.metadata)
                .map_err(|e| Error::InvalidArgument { message: format!("metadata is not valid JSON: {e}") })?;
            let mut file = FS::create(&fs_path)?;
            file.write_all(rendered.as_bytes())?;
        }
        Ok(())
    }
}

impl<FS: FileSystem> AssetSource for DirectoryAssetSource<FS> {
    fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }

    fn asset_paths(&self) -> Result<Vec<String>> {
        Ok(self.asset_paths.clone())
    }

    fn open(&self, path: &str) -> Result<Box<dyn IoDevice + Send>> {
        let fs_path = self.to_filesystem(path)?;
        let file = FS::open(&fs_path)?;
        Ok(Box::new(crate::device::FileDevice::from_file(file)))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let fs_path = self.to_filesystem(path)?;
        Ok(FS::read(&fs_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;

    fn write(dir: &std::path::Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn scans_nested_directories_and_sorts_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "sub/b.txt", "b");
        write(dir.path(), "sub/deeper/c.txt", "c");

        let source = DirectoryAssetSource::<StdFileSystem>::open(dir.path(), &[]).unwrap();
        assert_eq!(
            source.asset_paths().unwrap(),
            vec!["/a.txt".to_string(), "/sub/b.txt".to_string(), "/sub/deeper/c.txt".to_string()]
        );
        assert_eq!(source.read("/sub/b.txt").unwrap(), b"b".to_vec());
    }

    #[test]
    fn loads_underscore_metadata_in_preference_to_dotted_and_hides_it() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "_metadata", r#"{"pack":"demo"}"#);
        write(dir.path(), ".metadata", r#"{"pack":"wrong"}"#);
        write(dir.path(), "thing.txt", "x");

        let source = DirectoryAssetSource::<StdFileSystem>::open(dir.path(), &[]).unwrap();
        assert_eq!(source.metadata(), &serde_json::json!({"pack": "demo"}));
        assert_eq!(source.asset_paths().unwrap(), vec!["/thing.txt".to_string()]);
    }

    #[test]
    fn ignore_patterns_exclude_matching_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "keep.txt", "keep");
        write(dir.path(), "skip.tmp", "skip");

        let source =
            DirectoryAssetSource::<StdFileSystem>::open(dir.path(), &[r"\.tmp$".to_string()]).unwrap();
        assert_eq!(source.asset_paths().unwrap(), vec!["/keep.txt".to_string()]);
    }

    #[test]
    fn set_metadata_writes_then_deletes_when_emptied() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "a");
        let mut source = DirectoryAssetSource::<StdFileSystem>::open(dir.path(), &[]).unwrap();

        source.set_metadata(serde_json::json!({"k": "v"})).unwrap();
        assert!(dir.path().join("_metadata").exists());

        source.set_metadata(serde_json::json!({})).unwrap();
        assert!(!dir.path().join("_metadata").exists());
    }
}
