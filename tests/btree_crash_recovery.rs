// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Exercises the dual-root-slot commit protocol's crash-safety guarantee:
//! work done after the last successful commit and never explicitly
//! committed must not be visible after the file is reopened, while
//! everything up to and including the last commit must be.

use blockvault::{
    btree::block_store::{BTreeDb, BlockStoreConfig},
    device::{AccessMode, FileDevice},
};
use test_log::test;

fn config() -> BlockStoreConfig {
    BlockStoreConfig::default()
        .with_block_size(512)
        .with_key_size(8)
        .with_content_identifier("crash-recovery")
        .with_auto_commit(false)
}

#[test]
fn uncommitted_writes_do_not_survive_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    {
        let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
        let mut db = BTreeDb::open(device, config()).unwrap();

        for i in 1..=10u64 {
            db.insert(&i.to_be_bytes(), format!("committed-{i}").into_bytes()).unwrap();
        }
        db.commit().unwrap();

        for i in 11..=20u64 {
            db.insert(&i.to_be_bytes(), format!("uncommitted-{i}").into_bytes()).unwrap();
        }
        // Dropped here without another commit() call: equivalent to a crash
        // partway through building the next version of the tree.
    }

    let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
    let mut db = BTreeDb::open(device, config()).unwrap();

    assert_eq!(db.record_count().unwrap(), 10);
    for i in 1..=10u64 {
        assert_eq!(db.find(&i.to_be_bytes()).unwrap(), Some(format!("committed-{i}").into_bytes()));
    }
    for i in 11..=20u64 {
        assert_eq!(db.find(&i.to_be_bytes()).unwrap(), None);
    }
}

#[test]
fn explicit_rollback_discards_pending_writes_without_closing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");
    let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
    let mut db = BTreeDb::open(device, config()).unwrap();

    db.insert(&1u64.to_be_bytes(), b"keep".to_vec()).unwrap();
    db.commit().unwrap();

    db.insert(&2u64.to_be_bytes(), b"discard-me".to_vec()).unwrap();
    db.remove(&1u64.to_be_bytes()).unwrap();
    db.rollback().unwrap();

    assert_eq!(db.find(&1u64.to_be_bytes()).unwrap(), Some(b"keep".to_vec()));
    assert_eq!(db.find(&2u64.to_be_bytes()).unwrap(), None);
    assert_eq!(db.record_count().unwrap(), 1);
}

#[test]
fn commits_accumulate_across_many_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    for batch in 0..5u64 {
        let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
        let mut db = BTreeDb::open(device, config()).unwrap();
        for i in 0..4u64 {
            let key = batch * 4 + i;
            db.insert(&key.to_be_bytes(), format!("v{key}").into_bytes()).unwrap();
        }
        db.commit().unwrap();
    }

    let device = FileDevice::open(&path, AccessMode::READ_WRITE).unwrap();
    let mut db = BTreeDb::open(device, config()).unwrap();
    assert_eq!(db.record_count().unwrap(), 20);
    for key in 0..20u64 {
        assert_eq!(db.find(&key.to_be_bytes()).unwrap(), Some(format!("v{key}").into_bytes()));
    }
}
