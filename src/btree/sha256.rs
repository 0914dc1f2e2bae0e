// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-size-key wrapper around a [`super::block_store::BTreeDb`].
//!
//! Hashes arbitrary-length keys down to a 32-byte SHA-256 digest before
//! delegating to the underlying database, so callers with variable-length
//! or overly long natural keys (file paths, UUIDs, ...) can still use a
//! database whose on-disk format requires a fixed key size.

use super::block_store::{BTreeDb, BlockStoreConfig};
use crate::{device::IoDevice, Result};
use sha2::{Digest, Sha256};

/// Key size required of a [`Sha256Database`]'s underlying store.
pub const KEY_SIZE: u32 = 32;

/// Hashes `key` to the 32-byte digest used as the actual tree key.
#[must_use]
pub fn hash_key(key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.finalize().into()
}

/// A [`BTreeDb`]-backed database keyed by the SHA-256 hash of an arbitrary
/// byte string, rather than by the raw bytes themselves.
pub struct Sha256Database<D: IoDevice> {
    inner: BTreeDb<D>,
}

impl<D: IoDevice> Sha256Database<D> {
    /// Opens or creates a 32-byte-keyed database over `device`.
    ///
    /// `config.key_size` is forced to [`KEY_SIZE`] regardless of what was
    /// passed in, since this wrapper only ever addresses the tree by
    /// SHA-256 digest.
    pub fn open(device: D, config: BlockStoreConfig) -> Result<Self> {
        let config = config.with_key_size(KEY_SIZE);
        Ok(Self {
            inner: BTreeDb::open(device, config)?,
        })
    }

    /// Returns a reference to the wrapped database.
    pub fn inner(&self) -> &BTreeDb<D> {
        &self.inner
    }

    /// Returns a mutable reference to the wrapped database.
    pub fn inner_mut(&mut self) -> &mut BTreeDb<D> {
        &mut self.inner
    }

    /// Returns whether `key` is present.
    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        self.inner.contains(&hash_key(key))
    }

    /// Looks up `key`.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.find(&hash_key(key))
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.inner.insert(&hash_key(key), value)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.inner.remove(&hash_key(key))
    }

    /// Convenience overload for string keys (hashes the UTF-8 bytes).
    pub fn contains_str(&mut self, key: &str) -> Result<bool> {
        self.contains(key.as_bytes())
    }

    /// Convenience overload for string keys.
    pub fn find_str(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.find(key.as_bytes())
    }

    /// Convenience overload for string keys.
    pub fn insert_str(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.insert(key.as_bytes(), value)
    }

    /// Convenience overload for string keys.
    pub fn remove_str(&mut self, key: &str) -> Result<bool> {
        self.remove(key.as_bytes())
    }

    /// Commits all pending writes to disk.
    pub fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    /// Discards all changes since the last commit.
    pub fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    /// Number of distinct keys currently present.
    pub fn record_count(&mut self) -> Result<u64> {
        self.inner.record_count()
    }
}
