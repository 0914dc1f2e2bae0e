// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Exercises node splitting under sustained insertion, node
//! merging/shifting under sustained removal, and bounded range scans, using
//! a small block size so a handful of records is already enough to force
//! multiple levels of index nodes.

use blockvault::btree::block_store::{BTreeDb, BlockStoreConfig};
use blockvault::device::BufferDevice;
use rand::{seq::SliceRandom, SeedableRng};
use test_log::test;

fn key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

fn open_db() -> BTreeDb<BufferDevice> {
    let config = BlockStoreConfig::default()
        .with_block_size(256)
        .with_key_size(4)
        .with_content_identifier("split-merge");
    BTreeDb::open(BufferDevice::new(), config).unwrap()
}

#[test]
fn sustained_insertion_splits_into_multiple_index_levels() {
    let mut db = open_db();
    for i in 1..=500u32 {
        db.insert(&key(i), vec![b'x'; 24]).unwrap();
    }
    assert_eq!(db.record_count().unwrap(), 500);
    assert!(db.index_levels().unwrap() >= 2);

    let mut seen = Vec::new();
    db.for_each(|k, _| {
        seen.push(u32::from_be_bytes(k.try_into().unwrap()));
        Ok(())
    })
    .unwrap();
    let expected: Vec<u32> = (1..=500).collect();
    assert_eq!(seen, expected);
}

#[test]
fn removing_most_records_shifts_and_merges_back_down() {
    let mut db = open_db();
    for i in 1..=500u32 {
        db.insert(&key(i), vec![b'x'; 24]).unwrap();
    }
    let levels_before = db.index_levels().unwrap();

    for i in 1..=480u32 {
        assert!(db.remove(&key(i)).unwrap());
    }
    assert_eq!(db.record_count().unwrap(), 20);
    assert!(db.index_levels().unwrap() <= levels_before);

    let mut seen = Vec::new();
    db.for_each(|k, _| {
        seen.push(u32::from_be_bytes(k.try_into().unwrap()));
        Ok(())
    })
    .unwrap();
    let expected: Vec<u32> = (481..=500).collect();
    assert_eq!(seen, expected);
}

#[test]
fn random_order_insertion_and_removal_leaves_a_consistent_tree() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0FFEE);
    let mut order: Vec<u32> = (1..=300).collect();
    order.shuffle(&mut rng);

    let mut db = open_db();
    for &i in &order {
        db.insert(&key(i), vec![b'v'; 10]).unwrap();
    }
    assert_eq!(db.record_count().unwrap(), 300);

    let mut removal_order = order.clone();
    removal_order.shuffle(&mut rng);
    for &i in removal_order.iter().take(150) {
        assert!(db.remove(&key(i)).unwrap());
    }
    assert_eq!(db.record_count().unwrap(), 150);

    let mut seen = Vec::new();
    db.for_each(|k, _| {
        seen.push(u32::from_be_bytes(k.try_into().unwrap()));
        Ok(())
    })
    .unwrap();
    let mut expected: Vec<u32> = removal_order[150..].to_vec();
    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[test]
fn range_scan_returns_only_keys_within_bounds_in_order() {
    let mut db = open_db();
    for i in 1..=200u32 {
        db.insert(&key(i), vec![b'r'; 8]).unwrap();
    }

    let mut seen = Vec::new();
    let last = db
        .range(&key(50), &key(75), |k, _| {
            seen.push(u32::from_be_bytes(k.try_into().unwrap()));
            Ok(())
        })
        .unwrap();

    let expected: Vec<u32> = (50..75).collect();
    assert_eq!(seen, expected);
    assert_eq!(last, Some(key(74).to_vec()));
}
