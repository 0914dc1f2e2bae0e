// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block-structured file backend for the generic B+ tree algorithm.
//!
//! Implements [`super::BTreeBackend`] over a [`crate::device::IoDevice`]:
//! fixed-size block allocation with copy-on-write node versions, a
//! persistent free-block index chain, and an atomic dual-root-slot commit
//! protocol so a crash mid-commit never leaves a file that is neither the
//! old state nor the new one.

use crate::{
    byte_order::ByteOrder,
    coding::DecodeError,
    device::{IoDevice, SeekFrom},
    stream::DataStream,
    vlq, Error, Result,
};
use std::sync::Arc;

/// Sentinel meaning "no block" wherever a [`BlockIndex`] is stored.
pub const INVALID_BLOCK: BlockIndex = 0xFFFF_FFFF;

/// A 32-bit block index within a [`BlockStore`]'s file.
pub type BlockIndex = u32;

const HEADER_SIZE: u64 = 512;
const VERSION_MAGIC: &[u8; 8] = b"BTreeDB5";
const INDEX_MAGIC: &[u8; 2] = b"II";
const LEAF_MAGIC: &[u8; 2] = b"LL";
const FREE_MAGIC: &[u8; 2] = b"FF";
const CONTENT_IDENTIFIER_SIZE: usize = 12;
const ROOT_INFO_SIZE: u64 = 32;

fn some_block(raw: BlockIndex) -> Option<BlockIndex> {
    if raw == INVALID_BLOCK {
        None
    } else {
        Some(raw)
    }
}

fn raw_block(pointer: Option<BlockIndex>) -> BlockIndex {
    pointer.unwrap_or(INVALID_BLOCK)
}

/// Configuration for creating or opening a [`BlockStore`].
#[derive(Clone, Debug)]
pub struct BlockStoreConfig {
    /// Size in bytes of each allocation unit. Fixed for the lifetime of the
    /// file once created.
    pub block_size: u32,
    /// Fixed key size in bytes. Fixed for the lifetime of the file once
    /// created.
    pub key_size: u32,
    /// Free-form identifier (up to 12 UTF-8 bytes) describing the schema
    /// or application that owns this file; checked on every reopen.
    pub content_identifier: String,
    /// Maximum number of index nodes kept in the in-memory LRU cache.
    pub index_cache_size: u64,
    /// Whether mutating operations commit automatically. When `false`,
    /// callers must invoke [`BTreeDb::commit`] explicitly.
    pub auto_commit: bool,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            block_size: 2048,
            key_size: 16,
            content_identifier: String::new(),
            index_cache_size: 64,
            auto_commit: true,
        }
    }
}

impl BlockStoreConfig {
    /// Sets the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the fixed key size.
    #[must_use]
    pub fn with_key_size(mut self, key_size: u32) -> Self {
        self.key_size = key_size;
        self
    }

    /// Sets the content identifier (truncated to 12 UTF-8 bytes).
    #[must_use]
    pub fn with_content_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.content_identifier = identifier.into();
        self
    }

    /// Sets the index cache capacity.
    #[must_use]
    pub fn with_index_cache_size(mut self, size: u64) -> Self {
        self.index_cache_size = size;
        self
    }

    /// Sets whether mutations commit automatically.
    #[must_use]
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }
}

/// In-memory representation of an index (interior) node.
#[derive(Clone, Debug, Default)]
pub struct IndexNode {
    level: u8,
    begin_pointer: BlockIndex,
    /// `(separator key, pointer)` pairs; `entries[i].1` is the pointer at
    /// position `i + 1`, and `entries[i].0` separates it from the pointer
    /// before it.
    entries: Vec<(Vec<u8>, BlockIndex)>,
}

/// In-memory representation of a leaf node (possibly spanning several
/// on-disk blocks, transparently to the algorithm).
#[derive(Clone, Debug, Default)]
pub struct LeafNode {
    elements: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Clone, Copy, Debug, Default)]
struct RootInfo {
    head_free_index_block: BlockIndex,
    device_size: u64,
    root_block: BlockIndex,
    root_is_leaf: bool,
}

/// Block-structured, copy-on-write B+ tree backend.
pub struct BlockStore<D: IoDevice> {
    device: D,
    block_size: u32,
    key_size: u32,
    content_identifier: String,
    auto_commit: bool,

    using_alt_root: bool,

    head_free_index_block: Option<BlockIndex>,
    committed_device_size: u64,
    device_size: u64,

    root: Option<BlockIndex>,
    root_is_leaf: bool,

    available_blocks: Vec<BlockIndex>,
    pending_free: Vec<BlockIndex>,
    uncommitted: std::collections::HashSet<BlockIndex>,

    index_cache: quick_cache::sync::Cache<BlockIndex, Arc<IndexNode>>,
}

impl<D: IoDevice> BlockStore<D> {
    /// Opens an existing block store, or creates one (writing the header
    /// and an empty root leaf) if `device` is empty.
    pub fn open(mut device: D, config: BlockStoreConfig) -> Result<Self> {
        let size = device.size()?;

        let mut store = Self {
            device,
            block_size: config.block_size,
            key_size: config.key_size,
            content_identifier: config.content_identifier,
            auto_commit: config.auto_commit,
            using_alt_root: false,
            head_free_index_block: None,
            committed_device_size: HEADER_SIZE,
            device_size: HEADER_SIZE,
            root: None,
            root_is_leaf: true,
            available_blocks: Vec::new(),
            pending_free: Vec::new(),
            uncommitted: std::collections::HashSet::new(),
            index_cache: quick_cache::sync::Cache::new(config.index_cache_size.max(1) as usize),
        };

        if size == 0 {
            store.create_fresh()?;
        } else {
            store.open_existing()?;
        }

        Ok(store)
    }

    fn create_fresh(&mut self) -> Result<()> {
        self.device.resize(HEADER_SIZE)?;
        self.device_size = HEADER_SIZE;
        self.committed_device_size = HEADER_SIZE;
        self.using_alt_root = false;
        self.head_free_index_block = None;

        let leaf = LeafNode::default();
        let pointer = self.store_leaf_raw(None, leaf)?;
        self.root = Some(pointer);
        self.root_is_leaf = true;

        self.write_header()?;
        self.do_commit()
    }

    fn open_existing(&mut self) -> Result<()> {
        self.read_header()?;
        self.read_root()?;
        self.device.resize(self.committed_device_size)?;
        self.device_size = self.committed_device_size;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = vec![0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(VERSION_MAGIC);
        header[8..12].copy_from_slice(&self.block_size.to_be_bytes());

        let ident_bytes = self.content_identifier.as_bytes();
        let copy_len = ident_bytes.len().min(CONTENT_IDENTIFIER_SIZE);
        header[12..12 + copy_len].copy_from_slice(&ident_bytes[..copy_len]);

        header[24..28].copy_from_slice(&self.key_size.to_be_bytes());
        header[28] = u8::from(self.using_alt_root);

        let root_info = RootInfo {
            head_free_index_block: raw_block(self.head_free_index_block),
            device_size: self.committed_device_size,
            root_block: raw_block(self.root),
            root_is_leaf: self.root_is_leaf,
        };
        let slot_bytes = Self::encode_root_info(&root_info);
        header[32..32 + slot_bytes.len()].copy_from_slice(&slot_bytes);

        self.device.write_full_absolute(0, &header)?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let mut header = vec![0u8; HEADER_SIZE as usize];
        self.device.read_full_absolute(0, &mut header)?;

        if &header[0..8] != VERSION_MAGIC {
            return Err(Error::Format {
                context: "btree file header magic",
            });
        }

        let block_size = u32::from_be_bytes(header[8..12].try_into().expect("4 bytes"));
        let ident_end = header[12..12 + CONTENT_IDENTIFIER_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CONTENT_IDENTIFIER_SIZE);
        let content_identifier = String::from_utf8_lossy(&header[12..12 + ident_end]).into_owned();
        let key_size = u32::from_be_bytes(header[24..28].try_into().expect("4 bytes"));

        if block_size != self.block_size && self.block_size != BlockStoreConfig::default().block_size {
            return Err(Error::InvalidArgument {
                message: "block size does not match the configuration requested at open".into(),
            });
        }
        if key_size != self.key_size && self.key_size != BlockStoreConfig::default().key_size {
            return Err(Error::InvalidArgument {
                message: "key size does not match the configuration requested at open".into(),
            });
        }
        if !self.content_identifier.is_empty() && self.content_identifier != content_identifier {
            return Err(Error::InvalidArgument {
                message: "content identifier does not match the existing file".into(),
            });
        }

        self.block_size = block_size;
        self.key_size = key_size;
        self.content_identifier = content_identifier;
        self.using_alt_root = header[28] != 0;

        Ok(())
    }

    fn encode_root_info(info: &RootInfo) -> Vec<u8> {
        let mut buf = vec![0u8; ROOT_INFO_SIZE as usize];
        buf[0..4].copy_from_slice(&info.head_free_index_block.to_be_bytes());
        buf[4..12].copy_from_slice(&info.device_size.to_be_bytes());
        buf[12..16].copy_from_slice(&info.root_block.to_be_bytes());
        buf[16] = u8::from(info.root_is_leaf);
        buf
    }

    fn decode_root_info(bytes: &[u8]) -> RootInfo {
        RootInfo {
            head_free_index_block: u32::from_be_bytes(bytes[0..4].try_into().expect("4 bytes")),
            device_size: u64::from_be_bytes(bytes[4..12].try_into().expect("8 bytes")),
            root_block: u32::from_be_bytes(bytes[12..16].try_into().expect("4 bytes")),
            root_is_leaf: bytes[16] != 0,
        }
    }

    /// Re-reads the root-info slot indicated by the selector bit. Used at
    /// open time and by [`BlockStore::rollback`].
    fn read_root(&mut self) -> Result<()> {
        let mut selector = [0u8; 1];
        self.device.read_full_absolute(28, &mut selector)?;
        self.using_alt_root = selector[0] != 0;

        let slot_offset = 32 + if self.using_alt_root { ROOT_INFO_SIZE } else { 0 };
        let mut slot = vec![0u8; ROOT_INFO_SIZE as usize];
        self.device.read_full_absolute(slot_offset, &mut slot)?;
        let info = Self::decode_root_info(&slot);

        self.head_free_index_block = some_block(info.head_free_index_block);
        self.committed_device_size = info.device_size;
        self.root = some_block(info.root_block);
        self.root_is_leaf = info.root_is_leaf;

        Ok(())
    }

    /// Writes the alternate root-info slot, syncs, flips the selector
    /// byte, syncs again. A crash at any point before the second sync
    /// leaves the previously committed state selected and intact.
    fn write_root(&mut self) -> Result<()> {
        let info = RootInfo {
            head_free_index_block: raw_block(self.head_free_index_block),
            device_size: self.device_size,
            root_block: raw_block(self.root),
            root_is_leaf: self.root_is_leaf,
        };
        let alt_offset = 32 + if self.using_alt_root { 0 } else { ROOT_INFO_SIZE };
        let slot_bytes = Self::encode_root_info(&info);
        self.device.write_full_absolute(alt_offset, &slot_bytes)?;
        self.device.sync()?;

        self.using_alt_root = !self.using_alt_root;
        self.device.write_full_absolute(28, &[u8::from(self.using_alt_root)])?;
        self.device.sync()?;

        self.committed_device_size = self.device_size;
        Ok(())
    }

    fn check_block_index(&self, index: BlockIndex) -> Result<()> {
        let block_count = (self.device_size - HEADER_SIZE) / u64::from(self.block_size);
        if u64::from(index) >= block_count {
            return Err(Error::InvalidArgument {
                message: format!("block index {index} out of range (have {block_count} blocks)"),
            });
        }
        Ok(())
    }

    fn block_offset(&self, index: BlockIndex) -> u64 {
        HEADER_SIZE + u64::from(index) * u64::from(self.block_size)
    }

    fn read_block(&mut self, index: BlockIndex) -> Result<Vec<u8>> {
        self.check_block_index(index)?;
        let mut buf = vec![0u8; self.block_size as usize];
        let offset = self.block_offset(index);
        self.device.read_full_absolute(offset, &mut buf)?;
        Ok(buf)
    }

    fn write_block(&mut self, index: BlockIndex, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.block_size as usize);
        let offset = self.block_offset(index);
        self.device.write_full_absolute(offset, data)?;
        Ok(())
    }

    fn make_end_block(&mut self) -> Result<BlockIndex> {
        let block_count = (self.device_size - HEADER_SIZE) / u64::from(self.block_size);
        let new_index = u32::try_from(block_count).map_err(|_| Error::Exhausted)?;
        self.device_size += u64::from(self.block_size);
        self.device.resize(self.device_size)?;
        Ok(new_index)
    }

    fn reserve_block(&mut self) -> Result<BlockIndex> {
        if let Some(b) = self.available_blocks.pop() {
            self.uncommitted.insert(b);
            return Ok(b);
        }

        if let Some(head) = self.head_free_index_block {
            let (next, entries) = self.read_free_index_block(head)?;
            self.available_blocks.extend(entries);
            self.pending_free.push(head);
            self.head_free_index_block = next;
            return self.reserve_block();
        }

        let b = self.make_end_block()?;
        self.uncommitted.insert(b);
        Ok(b)
    }

    fn free_block(&mut self, b: BlockIndex) {
        if self.uncommitted.remove(&b) {
            self.available_blocks.push(b);
        } else {
            self.pending_free.push(b);
        }
    }

    fn read_free_index_block(&mut self, index: BlockIndex) -> Result<(Option<BlockIndex>, Vec<BlockIndex>)> {
        let block = self.read_block(index)?;
        if &block[0..2] != FREE_MAGIC {
            return Err(Error::Format {
                context: "free-index block magic",
            });
        }
        let next = u32::from_be_bytes(block[2..6].try_into().expect("4 bytes"));
        let count = u32::from_be_bytes(block[6..10].try_into().expect("4 bytes")) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut offset = 10;
        for _ in 0..count {
            entries.push(u32::from_be_bytes(block[offset..offset + 4].try_into().expect("4 bytes")));
            offset += 4;
        }
        Ok((some_block(next), entries))
    }

    fn write_free_index_block(&mut self, index: BlockIndex, next: Option<BlockIndex>, entries: &[BlockIndex]) -> Result<()> {
        let mut block = vec![0u8; self.block_size as usize];
        block[0..2].copy_from_slice(FREE_MAGIC);
        block[2..6].copy_from_slice(&raw_block(next).to_be_bytes());
        block[6..10].copy_from_slice(&(entries.len() as u32).to_be_bytes());
        let mut offset = 10;
        for &e in entries {
            block[offset..offset + 4].copy_from_slice(&e.to_be_bytes());
            offset += 4;
        }
        self.write_block(index, &block)
    }

    fn max_free_index_length(&self) -> usize {
        (self.block_size as usize - 10) / 4
    }

    /// Rewrites the free-index chain so it represents exactly
    /// `available_blocks ∪ pending_free`, then performs the dual-root
    /// atomic commit. A no-op if nothing changed since the last commit.
    pub fn do_commit(&mut self) -> Result<()> {
        if self.available_blocks.is_empty() && self.pending_free.is_empty() && self.uncommitted.is_empty() {
            return Ok(());
        }

        let max_len = self.max_free_index_length();
        let mut head_entries: Vec<BlockIndex> = Vec::new();
        let mut head_next = self.head_free_index_block;

        if let Some(head) = self.head_free_index_block {
            let (next, entries) = self.read_free_index_block(head)?;
            if entries.len() < max_len {
                head_entries = entries;
                head_next = next;
                self.free_block(head);
            }
        }

        // Prefer draining pending_free first: those blocks are still
        // referenced by the previous committed root and cannot be reused
        // within this transaction, so parking them in the free-index chain
        // first keeps available_blocks maximally reusable right now.
        let mut current_index = self.head_free_index_block;
        loop {
            while head_entries.len() < max_len {
                if let Some(b) = self.pending_free.pop() {
                    head_entries.push(b);
                } else if let Some(b) = self.available_blocks.pop() {
                    head_entries.push(b);
                } else {
                    break;
                }
            }

            if self.pending_free.is_empty() && self.available_blocks.is_empty() {
                break;
            }

            let new_head = if let Some(b) = self.available_blocks.pop() {
                b
            } else {
                self.make_end_block()?
            };
            self.write_free_index_block(new_head, current_index, &head_entries)?;
            current_index = Some(new_head);
            head_entries.clear();
            head_next = current_index;
        }

        let final_head = if head_entries.is_empty() && current_index.is_some() {
            current_index
        } else if head_entries.is_empty() {
            None
        } else {
            let new_head = if let Some(b) = self.available_blocks.pop() {
                b
            } else {
                self.make_end_block()?
            };
            self.write_free_index_block(new_head, head_next, &head_entries)?;
            Some(new_head)
        };

        self.head_free_index_block = final_head;
        self.write_root()?;
        self.uncommitted.clear();

        Ok(())
    }

    /// Discards everything since the last commit: in-flight allocations,
    /// the index cache, and the free-list working sets, then re-reads the
    /// committed root.
    pub fn rollback(&mut self) -> Result<()> {
        self.available_blocks.clear();
        self.pending_free.clear();
        self.uncommitted.clear();
        self.index_cache.clear();
        self.read_root()?;
        self.device_size = self.committed_device_size;
        self.device.resize(self.device_size)?;
        Ok(())
    }

    fn max_index_pointers(&self) -> usize {
        let fixed = 2 + 1 + 4 + 4; // magic + level + count + begin pointer
        let per_entry = self.key_size as usize + 4;
        (self.block_size as usize - fixed) / per_entry + 1
    }

    fn encode_index(&self, node: &IndexNode) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size as usize];
        buf[0..2].copy_from_slice(INDEX_MAGIC);
        buf[2] = node.level;
        let count = (node.entries.len() + 1) as u32;
        buf[3..7].copy_from_slice(&count.to_be_bytes());
        buf[7..11].copy_from_slice(&node.begin_pointer.to_be_bytes());

        let mut offset = 11;
        let key_size = self.key_size as usize;
        for (key, pointer) in &node.entries {
            buf[offset..offset + key_size].copy_from_slice(key);
            offset += key_size;
            buf[offset..offset + 4].copy_from_slice(&pointer.to_be_bytes());
            offset += 4;
        }
        buf
    }

    fn decode_index(&self, block: &[u8]) -> Result<IndexNode> {
        if &block[0..2] != INDEX_MAGIC {
            return Err(Error::Format { context: "index block magic" });
        }
        let level = block[2];
        let count = u32::from_be_bytes(block[3..7].try_into().expect("4 bytes")) as usize;
        let begin_pointer = u32::from_be_bytes(block[7..11].try_into().expect("4 bytes"));

        let key_size = self.key_size as usize;
        let mut entries = Vec::with_capacity(count.saturating_sub(1));
        let mut offset = 11;
        for _ in 0..count.saturating_sub(1) {
            let key = block[offset..offset + key_size].to_vec();
            offset += key_size;
            let pointer = u32::from_be_bytes(block[offset..offset + 4].try_into().expect("4 bytes"));
            offset += 4;
            entries.push((key, pointer));
        }

        Ok(IndexNode {
            level,
            begin_pointer,
            entries,
        })
    }

    /// Fixed 6-byte-per-element-plus-header cost used to decide whether a
    /// leaf needs to split: `6` bytes of framing overhead plus
    /// `key_size + vlq_len(value.len()) + value.len()` per element.
    fn leaf_size(&self, leaf: &LeafNode) -> usize {
        let key_size = self.key_size as usize;
        6 + leaf
            .elements
            .iter()
            .map(|(_, value)| key_size + vlq::size_u(value.len() as u64) + value.len())
            .sum::<usize>()
    }

    /// Boundary-finding threshold used only to locate *where* within a
    /// leaf's element list to split: roughly one block minus the trailing
    /// next-block pointer.
    fn leaf_split_threshold(&self) -> usize {
        self.block_size as usize - 4
    }

    /// Decision threshold for *whether* a leaf splits at all: roughly two
    /// blocks, so a leaf is allowed to chain across a second block before
    /// splitting rather than splitting as soon as it outgrows one block.
    fn leaf_split_decision_threshold(&self) -> usize {
        2 * self.block_size as usize - 2 * 4 - 4
    }

    fn encode_leaf_content(&self, leaf: &LeafNode) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(leaf.elements.len() as u32).to_be_bytes());
        for (key, value) in &leaf.elements {
            buf.extend_from_slice(key);
            vlq::write_u(&mut buf, value.len() as u64).expect("writing to a Vec cannot fail");
            buf.extend_from_slice(value);
        }
        buf
    }

    fn decode_leaf_content(&self, buf: &[u8]) -> Result<LeafNode> {
        let mut cursor = buf;
        let mut count_bytes = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut count_bytes)
            .map_err(|_| Error::Format { context: "leaf element count" })?;
        let count = u32::from_be_bytes(count_bytes) as usize;

        let key_size = self.key_size as usize;
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            if cursor.len() < key_size {
                return Err(Error::Format { context: "leaf key" });
            }
            let key = cursor[..key_size].to_vec();
            cursor = &cursor[key_size..];

            let value_len = vlq::read_u(&mut cursor).map_err(|e| match e {
                DecodeError::InvalidVlq => Error::Format { context: "leaf value length" },
                other => other.into(),
            })? as usize;
            if cursor.len() < value_len {
                return Err(Error::Format { context: "leaf value" });
            }
            let value = cursor[..value_len].to_vec();
            cursor = &cursor[value_len..];

            elements.push((key, value));
        }

        Ok(LeafNode { elements })
    }

    /// Writes `leaf`'s content across as many chained blocks as needed,
    /// freeing the old chain rooted at `old_pointer` first (if any).
    fn store_leaf_raw(&mut self, old_pointer: Option<BlockIndex>, leaf: LeafNode) -> Result<BlockIndex> {
        if let Some(old) = old_pointer {
            self.free_leaf_chain(old)?;
        }

        let content = self.encode_leaf_content(&leaf);
        let payload_capacity = self.block_size as usize - 2 - 4;
        let chunks: Vec<&[u8]> = if content.is_empty() {
            vec![&content[..]]
        } else {
            content.chunks(payload_capacity).collect()
        };

        let mut pointers = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            pointers.push(self.reserve_block()?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let mut block = vec![0u8; self.block_size as usize];
            block[0..2].copy_from_slice(LEAF_MAGIC);
            block[2..2 + chunk.len()].copy_from_slice(chunk);
            let next = pointers.get(i + 1).copied();
            let trailer_offset = self.block_size as usize - 4;
            block[trailer_offset..].copy_from_slice(&raw_block(next).to_be_bytes());
            self.write_block(pointers[i], &block)?;
        }

        Ok(pointers[0])
    }

    fn load_leaf_raw(&mut self, pointer: BlockIndex) -> Result<LeafNode> {
        let mut content = Vec::new();
        let mut current = pointer;
        loop {
            let block = self.read_block(current)?;
            if &block[0..2] != LEAF_MAGIC {
                return Err(Error::Format { context: "leaf block magic" });
            }
            let trailer_offset = self.block_size as usize - 4;
            content.extend_from_slice(&block[2..trailer_offset]);
            let next = u32::from_be_bytes(block[trailer_offset..].try_into().expect("4 bytes"));
            match some_block(next) {
                Some(n) => current = n,
                None => break,
            }
        }
        self.decode_leaf_content(&content)
    }

    fn free_leaf_chain(&mut self, pointer: BlockIndex) -> Result<()> {
        let mut current = pointer;
        loop {
            let block = self.read_block(current)?;
            let trailer_offset = self.block_size as usize - 4;
            let next = u32::from_be_bytes(block[trailer_offset..].try_into().expect("4 bytes"));
            self.free_block(current);
            match some_block(next) {
                Some(n) => current = n,
                None => return Ok(()),
            }
        }
    }

    /// Number of physical blocks backing a leaf's chain.
    fn leaf_chain_length(&mut self, pointer: BlockIndex) -> Result<u64> {
        let mut count = 0u64;
        let mut current = pointer;
        loop {
            let block = self.read_block(current)?;
            count += 1;
            let trailer_offset = self.block_size as usize - 4;
            let next = u32::from_be_bytes(block[trailer_offset..].try_into().expect("4 bytes"));
            match some_block(next) {
                Some(n) => current = n,
                None => return Ok(count),
            }
        }
    }

    /// Total number of blocks in the file's block region (beyond the
    /// 512-byte header), including currently-free ones.
    pub fn total_block_count(&self) -> u64 {
        (self.device_size - HEADER_SIZE) / u64::from(self.block_size)
    }

    /// Approximate count of currently unused blocks: the in-memory
    /// available/pending-free working sets plus the on-disk free-index
    /// chain.
    pub fn free_block_count(&mut self) -> Result<u64> {
        let mut count = (self.available_blocks.len() + self.pending_free.len()) as u64;
        let mut current = self.head_free_index_block;
        while let Some(index) = current {
            let (next, entries) = self.read_free_index_block(index)?;
            count += entries.len() as u64 + 1;
            current = next;
        }
        Ok(count)
    }
}

impl<D: IoDevice> super::BTreeBackend for BlockStore<D> {
    type Key = Vec<u8>;
    type Data = Vec<u8>;
    type Pointer = BlockIndex;
    type Index = IndexNode;
    type Leaf = LeafNode;

    fn root_pointer(&self) -> Option<BlockIndex> {
        self.root
    }

    fn root_is_leaf(&self) -> bool {
        self.root_is_leaf
    }

    fn set_new_root(&mut self, pointer: Option<BlockIndex>, is_leaf: bool) -> Result<()> {
        self.root = pointer;
        self.root_is_leaf = is_leaf;
        if self.auto_commit {
            self.do_commit()?;
        }
        Ok(())
    }

    fn create_index(&mut self, level: u8) -> IndexNode {
        IndexNode {
            level,
            begin_pointer: INVALID_BLOCK,
            entries: Vec::new(),
        }
    }

    fn index_set_first_pointer(&self, index: &mut IndexNode, pointer: BlockIndex) {
        index.begin_pointer = pointer;
    }

    fn load_index(&mut self, pointer: BlockIndex) -> Result<IndexNode> {
        if let Some(cached) = self.index_cache.get(&pointer) {
            return Ok((*cached).clone());
        }
        let block = self.read_block(pointer)?;
        let node = self.decode_index(&block)?;
        self.index_cache.insert(pointer, Arc::new(node.clone()));
        Ok(node)
    }

    fn store_index(&mut self, old_pointer: Option<BlockIndex>, index: IndexNode) -> Result<BlockIndex> {
        if let Some(old) = old_pointer {
            self.free_block(old);
            self.index_cache.remove(&old);
        }
        let pointer = self.reserve_block()?;
        let bytes = self.encode_index(&index);
        self.write_block(pointer, &bytes)?;
        self.index_cache.insert(pointer, Arc::new(index));
        Ok(pointer)
    }

    fn delete_index(&mut self, pointer: BlockIndex) -> Result<()> {
        self.free_block(pointer);
        self.index_cache.remove(&pointer);
        Ok(())
    }

    fn index_pointer_count(&self, index: &IndexNode) -> usize {
        index.entries.len() + 1
    }

    fn index_level(&self, index: &IndexNode) -> u8 {
        index.level
    }

    fn index_pointer(&self, index: &IndexNode, i: usize) -> BlockIndex {
        if i == 0 {
            index.begin_pointer
        } else {
            index.entries[i - 1].1
        }
    }

    fn index_update_pointer(&self, index: &mut IndexNode, i: usize, pointer: BlockIndex) {
        if i == 0 {
            index.begin_pointer = pointer;
        } else {
            index.entries[i - 1].1 = pointer;
        }
    }

    fn index_key_before(&self, index: &IndexNode, i: usize) -> Vec<u8> {
        index.entries[i - 1].0.clone()
    }

    fn index_update_key_before(&self, index: &mut IndexNode, i: usize, key: Vec<u8>) {
        index.entries[i - 1].0 = key;
    }

    fn index_remove_before(&self, index: &mut IndexNode, i: usize) {
        index.entries.remove(i - 1);
    }

    fn index_insert_after(&self, index: &mut IndexNode, i: usize, key: Vec<u8>, pointer: BlockIndex) {
        index.entries.insert(i, (key, pointer));
    }

    fn index_needs_shift(&self, index: &IndexNode) -> bool {
        self.index_pointer_count(index) < (self.max_index_pointers() + 1) / 2
    }

    fn index_shift(&self, left: &mut IndexNode, mid_key: &Vec<u8>, right: &mut IndexNode) -> super::ShiftOutcome {
        let combined = self.index_pointer_count(left) + self.index_pointer_count(right);
        if combined <= self.max_index_pointers() {
            left.entries.push((mid_key.clone(), right.begin_pointer));
            left.entries.append(&mut right.entries);
            return super::ShiftOutcome::Merged;
        }

        if self.index_needs_shift(right) {
            // `left` is the fuller side: move its last pointer in to
            // become right's new begin pointer, bridged by `mid_key`.
            if let Some((_, moved_pointer)) = left.entries.pop() {
                let old_right_begin = right.begin_pointer;
                right.entries.insert(0, (mid_key.clone(), old_right_begin));
                right.begin_pointer = moved_pointer;
                return super::ShiftOutcome::Shifted;
            }
        } else if self.index_needs_shift(left) {
            // `right` is the fuller side: move its begin pointer out to
            // become left's new last pointer.
            if !right.entries.is_empty() {
                left.entries.push((mid_key.clone(), right.begin_pointer));
                let (_, new_begin_pointer) = right.entries.remove(0);
                right.begin_pointer = new_begin_pointer;
                return super::ShiftOutcome::Shifted;
            }
        }

        super::ShiftOutcome::Unchanged
    }

    fn index_split(&self, index: &mut IndexNode) -> Option<(Vec<u8>, IndexNode)> {
        if self.index_pointer_count(index) <= self.max_index_pointers() {
            return None;
        }
        let mid = index.entries.len() / 2;
        let (middle_key, right_begin) = index.entries[mid].clone();
        let right_entries = index.entries.split_off(mid + 1);
        index.entries.truncate(mid);

        Some((
            middle_key,
            IndexNode {
                level: index.level,
                begin_pointer: right_begin,
                entries: right_entries,
            },
        ))
    }

    fn create_leaf(&mut self) -> LeafNode {
        LeafNode::default()
    }

    fn load_leaf(&mut self, pointer: BlockIndex) -> Result<LeafNode> {
        self.load_leaf_raw(pointer)
    }

    fn store_leaf(&mut self, old_pointer: Option<BlockIndex>, leaf: LeafNode) -> Result<BlockIndex> {
        self.store_leaf_raw(old_pointer, leaf)
    }

    fn delete_leaf(&mut self, pointer: BlockIndex) -> Result<()> {
        self.free_leaf_chain(pointer)
    }

    fn leaf_element_count(&self, leaf: &LeafNode) -> usize {
        leaf.elements.len()
    }

    fn leaf_key(&self, leaf: &LeafNode, i: usize) -> Vec<u8> {
        leaf.elements[i].0.clone()
    }

    fn leaf_data(&self, leaf: &LeafNode, i: usize) -> Vec<u8> {
        leaf.elements[i].1.clone()
    }

    fn leaf_insert(&self, leaf: &mut LeafNode, i: usize, key: Vec<u8>, data: Vec<u8>) {
        leaf.elements.insert(i, (key, data));
    }

    fn leaf_remove(&self, leaf: &mut LeafNode, i: usize) {
        leaf.elements.remove(i);
    }

    fn set_next_leaf(&self, _leaf: &mut LeafNode, _pointer: Option<BlockIndex>) {
        // This backend does not persist a key-order next-leaf pointer;
        // range scans always re-descend through the index instead.
    }

    fn next_leaf(&self, _leaf: &LeafNode) -> Option<BlockIndex> {
        None
    }

    fn leaf_needs_shift(&self, leaf: &LeafNode) -> bool {
        self.leaf_size(leaf) * 2 < self.block_size as usize
    }

    fn leaf_shift(&self, left: &mut LeafNode, right: &mut LeafNode) -> super::ShiftOutcome {
        if left.elements.is_empty() || right.elements.is_empty() {
            left.elements.append(&mut right.elements);
            return super::ShiftOutcome::Merged;
        }

        let combined_size = self.leaf_size(left) + self.leaf_size(right) - 6;
        if combined_size <= self.leaf_split_threshold() {
            left.elements.append(&mut right.elements);
            return super::ShiftOutcome::Merged;
        }

        if self.leaf_needs_shift(right) {
            // `left` is the fuller side: move its last element onto the
            // front of `right`.
            if let Some(moved) = left.elements.pop() {
                right.elements.insert(0, moved);
                return super::ShiftOutcome::Shifted;
            }
        } else if self.leaf_needs_shift(left) {
            // `right` is the fuller side: move its first element onto the
            // back of `left`.
            if !right.elements.is_empty() {
                let moved = right.elements.remove(0);
                left.elements.push(moved);
                return super::ShiftOutcome::Shifted;
            }
        }

        super::ShiftOutcome::Unchanged
    }

    fn leaf_split(&self, leaf: &mut LeafNode) -> Option<LeafNode> {
        if leaf.elements.len() < 2 {
            return None;
        }

        let key_size = self.key_size as usize;
        let mut cumulative = 6usize;
        let mut boundary = 0usize;
        let mut boundary_found = false;
        for (i, (_, value)) in leaf.elements.iter().enumerate() {
            cumulative += key_size + vlq::size_u(value.len() as u64) + value.len();
            if cumulative > self.leaf_split_threshold() && !boundary_found {
                boundary = i;
                boundary_found = true;
            }
        }
        if boundary == 0 {
            boundary = 1;
        }

        if cumulative < self.leaf_split_decision_threshold() {
            return None;
        }

        let right_elements = leaf.elements.split_off(boundary.min(leaf.elements.len() - 1));
        Some(LeafNode {
            elements: right_elements,
        })
    }
}

/// A mutable-key/value, persistent B+ tree database over an
/// [`IoDevice`]-backed block store.
///
/// This is the public entry point most callers use; it wraps
/// [`super::Tree`] over a [`BlockStore`] and adds the database-level
/// operations (`commit`, `rollback`, `record_count`, block accounting)
/// that sit outside the generic tree algorithm.
pub struct BTreeDb<D: IoDevice> {
    tree: super::Tree<BlockStore<D>>,
}

impl<D: IoDevice> BTreeDb<D> {
    /// Opens or creates a database.
    pub fn open(device: D, config: BlockStoreConfig) -> Result<Self> {
        Ok(Self {
            tree: super::Tree::new(BlockStore::open(device, config)?),
        })
    }

    /// Returns whether `key` is present. `key` must be exactly `key_size`
    /// bytes.
    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        self.tree.contains(&key.to_vec())
    }

    /// Looks up `key`.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        self.tree.find(&key.to_vec())
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_key(key)?;
        self.tree.insert(key.to_vec(), value)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        self.tree.remove(&key.to_vec())
    }

    /// Visits every key/value pair in ascending key order.
    pub fn for_each(&mut self, visitor: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let mut visitor = visitor;
        self.tree.for_each(|k, v| visitor(k, v))
    }

    /// Visits every key/value pair `k` with `lower <= k < upper`, in
    /// ascending key order, pruning subtrees outside the range instead of
    /// loading them. Returns the greatest key visited, if any.
    pub fn range(
        &mut self,
        lower: &[u8],
        upper: &[u8],
        visitor: impl FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<Option<Vec<u8>>> {
        self.check_key(lower)?;
        self.check_key(upper)?;
        let mut visitor = visitor;
        self.tree.range(&lower.to_vec(), &upper.to_vec(), |k, v| visitor(k, v))
    }

    /// Best-effort traversal that salvages readable key/value pairs from a
    /// damaged file instead of aborting on the first error.
    pub fn recover_all(&mut self, visitor: impl FnMut(&[u8], &[u8]), on_error: impl FnMut(Error)) {
        let mut visitor = visitor;
        let mut on_error = on_error;
        self.tree.recover_all(|k, v| visitor(k, v), |e| on_error(e));
    }

    /// Number of distinct keys currently present.
    pub fn record_count(&mut self) -> Result<u64> {
        let mut count = 0u64;
        self.tree.for_each(|_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Number of index levels above the leaves.
    pub fn index_levels(&mut self) -> Result<u8> {
        self.tree.index_levels()
    }

    /// Commits all changes since the last commit.
    pub fn commit(&mut self) -> Result<()> {
        self.tree.backend_mut().do_commit()
    }

    /// Discards all changes since the last commit.
    pub fn rollback(&mut self) -> Result<()> {
        self.tree.backend_mut().rollback()
    }

    /// Total number of blocks in the block region of the file.
    pub fn total_block_count(&self) -> u64 {
        self.tree.backend().total_block_count()
    }

    /// Approximate number of currently free blocks.
    pub fn free_block_count(&mut self) -> Result<u64> {
        self.tree.backend_mut().free_block_count()
    }

    /// Counts index and leaf blocks currently reachable from the root.
    /// Leaves that chain across multiple blocks count each block in the
    /// chain.
    pub fn node_block_counts(&mut self) -> Result<(u64, u64)> {
        let Some(root) = self.tree.backend().root_pointer() else {
            return Ok((0, 0));
        };
        self.count_nodes(root, self.tree.backend().root_is_leaf())
    }

    fn count_nodes(&mut self, pointer: BlockIndex, is_leaf: bool) -> Result<(u64, u64)> {
        if is_leaf {
            let chain_len = self.tree.backend_mut().leaf_chain_length(pointer)?;
            return Ok((0, chain_len));
        }

        let index = self.tree.backend_mut().load_index(pointer)?;
        let child_is_leaf = index.level == 1;
        let mut index_count = 1u64;
        let mut leaf_count = 0u64;
        for i in 0..self.tree.backend().index_pointer_count(&index) {
            let child = self.tree.backend().index_pointer(&index, i);
            let (ic, lc) = self.count_nodes(child, child_is_leaf)?;
            index_count += ic;
            leaf_count += lc;
        }
        Ok((index_count, leaf_count))
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.tree.backend().key_size as usize {
            return Err(Error::InvalidArgument {
                message: format!(
                    "key is {} bytes, expected {}",
                    key.len(),
                    self.tree.backend().key_size
                ),
            });
        }
        Ok(())
    }
}
