// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, fixed-key-size, variable-value-size B+ tree key/value
//! store, plus a read-only packed asset archive format.
//!
//! ##### About
//!
//! This crate is a from-scratch Rust port of the storage core of a C++
//! game engine support library: a copy-on-write B+ tree over a
//! block-allocated file ([`btree`]) with an atomic dual-header commit
//! protocol, and a single-file, sorted, path-addressable asset archive
//! ([`archive`]) built by scanning a directory tree.
//!
//! Both share a common random-access I/O device abstraction ([`device`])
//! and a typed serialization stream ([`stream`]) built on endianness-tagged
//! primitives ([`byte_order`]) and variable-length integers ([`vlq`]).
//!
//! ##### Example
//!
//! ```
//! use blockvault::btree::block_store::{BTreeDb, BlockStoreConfig};
//! use blockvault::device::BufferDevice;
//!
//! let config = BlockStoreConfig::default()
//!     .with_block_size(512)
//!     .with_key_size(8)
//!     .with_content_identifier("example");
//! let mut db = BTreeDb::open(BufferDevice::new(), config)?;
//!
//! db.insert(&1u64.to_be_bytes(), b"hello".to_vec())?;
//! assert_eq!(db.find(&1u64.to_be_bytes())?, Some(b"hello".to_vec()));
//! # Ok::<(), blockvault::Error>(())
//! ```
//!
//! ##### Non-goals
//!
//! No multi-writer concurrency, no networked replication, no schema or
//! typed-value layer above raw byte keys/values, and no compression of
//! individual B+ tree records (though [`compression`] offers a
//! block-level compressed stream primitive for callers that want it).

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod btree;
pub mod byte_order;
pub mod coding;
pub mod compression;
pub mod device;
mod error;
pub mod fs;
pub mod stream;
pub mod vlq;

mod slice;

pub use error::{Error, Result};
pub use slice::Slice;
