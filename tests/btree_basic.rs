// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end coverage of a fresh database: open an empty file, insert,
//! look up, overwrite, and remove, then reopen it from the same path and
//! confirm everything survived.

use blockvault::{
    btree::block_store::{BTreeDb, BlockStoreConfig},
    device::{AccessMode, FileDevice},
};
use test_log::test;

fn config() -> BlockStoreConfig {
    BlockStoreConfig::default()
        .with_block_size(512)
        .with_key_size(8)
        .with_content_identifier("btree-basic")
}

#[test]
fn opening_an_empty_file_produces_an_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");
    let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();

    let mut db = BTreeDb::open(device, config()).unwrap();
    assert_eq!(db.record_count().unwrap(), 0);
    assert!(!db.contains(&1u64.to_be_bytes()).unwrap());
}

#[test]
fn insert_find_overwrite_and_remove_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");
    let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
    let mut db = BTreeDb::open(device, config()).unwrap();

    db.insert(&1u64.to_be_bytes(), b"one".to_vec()).unwrap();
    db.insert(&2u64.to_be_bytes(), b"two".to_vec()).unwrap();
    assert_eq!(db.find(&1u64.to_be_bytes()).unwrap(), Some(b"one".to_vec()));
    assert_eq!(db.find(&2u64.to_be_bytes()).unwrap(), Some(b"two".to_vec()));
    assert_eq!(db.find(&3u64.to_be_bytes()).unwrap(), None);

    db.insert(&1u64.to_be_bytes(), b"updated".to_vec()).unwrap();
    assert_eq!(db.find(&1u64.to_be_bytes()).unwrap(), Some(b"updated".to_vec()));

    assert!(db.remove(&2u64.to_be_bytes()).unwrap());
    assert!(!db.remove(&2u64.to_be_bytes()).unwrap());
    assert_eq!(db.find(&2u64.to_be_bytes()).unwrap(), None);
    assert_eq!(db.record_count().unwrap(), 1);
}

#[test]
fn data_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    {
        let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
        let mut db = BTreeDb::open(device, config()).unwrap();
        for i in 1..=20u64 {
            db.insert(&i.to_be_bytes(), format!("value-{i}").into_bytes()).unwrap();
        }
    }

    let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
    let mut db = BTreeDb::open(device, config()).unwrap();
    assert_eq!(db.record_count().unwrap(), 20);
    for i in 1..=20u64 {
        assert_eq!(db.find(&i.to_be_bytes()).unwrap(), Some(format!("value-{i}").into_bytes()));
    }
}

#[test]
fn rejects_keys_of_the_wrong_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");
    let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
    let mut db = BTreeDb::open(device, config()).unwrap();

    assert!(db.insert(b"short", b"x".to_vec()).is_err());
    assert!(db.find(b"this key is far too long for the configured key size").is_err());
}
