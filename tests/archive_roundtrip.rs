// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builds a packed asset archive from a directory on disk, then confirms
//! the reader sees the same assets, metadata, and byte contents, plus the
//! read-only random-access view returned by `open`.

use blockvault::{
    archive::{build, source::{AssetSource, DirectoryAssetSource}, ArchiveBuildConfig, ArchiveReader},
    device::{AccessMode, FileDevice, IoDevice},
};
use std::fs;
use test_log::test;

fn write(dir: &std::path::Path, relative: &str, contents: &[u8]) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

#[test]
fn build_from_directory_then_read_back_everything() {
    let source_dir = tempfile::tempdir().unwrap();
    write(source_dir.path(), "_metadata", br#"{"name":"demo pack","version":1}"#);
    write(source_dir.path(), "sprites/hero.png", b"pngbytes-hero");
    write(source_dir.path(), "sprites/enemy.png", b"pngbytes-enemy");
    write(source_dir.path(), "scripts/main.lua", b"return 42");
    write(source_dir.path(), "readme.txt", b"a pack of things");

    let directory_source = DirectoryAssetSource::open(source_dir.path(), &[]).unwrap();

    let archive_dir = tempfile::tempdir().unwrap();
    let archive_path = archive_dir.path().join("pack.pak");
    let mut archive_device = FileDevice::open(&archive_path, AccessMode::READ_WRITE).unwrap();
    let config = ArchiveBuildConfig::default().with_extension_sorting(["lua".to_string(), "png".to_string()]);
    build(&mut archive_device, &directory_source, &config).unwrap();
    drop(archive_device);

    let reader_device = FileDevice::open(&archive_path, AccessMode::READ).unwrap();
    let reader = ArchiveReader::open(reader_device).unwrap();

    assert_eq!(reader.metadata(), &serde_json::json!({"name": "demo pack", "version": 1}));

    let mut paths = reader.asset_paths().unwrap();
    paths.sort_unstable();
    assert_eq!(
        paths,
        vec![
            "/readme.txt".to_string(),
            "/scripts/main.lua".to_string(),
            "/sprites/enemy.png".to_string(),
            "/sprites/hero.png".to_string(),
        ]
    );
    // The metadata file itself must never be enumerated as an asset.
    assert!(!paths.iter().any(|p| p.contains("metadata")));

    assert_eq!(reader.read("/sprites/hero.png").unwrap(), b"pngbytes-hero".to_vec());
    assert_eq!(reader.read("/scripts/main.lua").unwrap(), b"return 42".to_vec());
    assert_eq!(reader.read("/readme.txt").unwrap(), b"a pack of things".to_vec());
    assert!(reader.read("/does/not/exist").is_err());

    let mut handle = reader.open("/sprites/enemy.png").unwrap();
    let mut buf = vec![0u8; 64];
    let n = handle.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pngbytes-enemy");
    assert_eq!(handle.read(&mut buf).unwrap(), 0);
}

#[test]
fn empty_directory_produces_a_readable_empty_archive() {
    let source_dir = tempfile::tempdir().unwrap();
    let directory_source = DirectoryAssetSource::open(source_dir.path(), &[]).unwrap();

    let mut device = blockvault::device::BufferDevice::new();
    build(&mut device, &directory_source, &ArchiveBuildConfig::default()).unwrap();

    let reader = ArchiveReader::open(device).unwrap();
    assert!(reader.asset_paths().unwrap().is_empty());
    assert_eq!(reader.metadata(), &serde_json::json!({}));
}
