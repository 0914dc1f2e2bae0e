// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Generic, storage-agnostic B+ tree algorithm.
//!
//! The algorithm here is ported from a C++ `BTreeMixin<Base>` template
//! mixin: everything that knows how to navigate and rebalance the tree
//! lives in [`Tree`], and everything that knows how nodes are actually
//! represented and persisted lives behind the [`BTreeBackend`] trait.
//! [`crate::btree::block_store`] is the concrete backend used by
//! `BTreeDb`; tests in this module use a trivial in-memory backend.

pub mod block_store;
pub mod sha256;

use crate::Result;

/// An update to apply to the tree.
enum Action<K, D> {
    Insert(K, D),
    Remove(K),
}

impl<K, D> Action<K, D> {
    fn key(&self) -> &K {
        match self {
            Self::Insert(k, _) => k,
            Self::Remove(k) => k,
        }
    }
}

/// Outcome of applying an [`Action`] to a subtree, reported back to the
/// caller so it can keep the tree balanced.
enum Modify<K, P> {
    /// The subtree absorbed the change; nothing further to do.
    Done,
    /// The subtree shrank below its minimum occupancy and should be
    /// shifted or merged with a sibling by the caller.
    NeedsJoin,
    /// The subtree's first key changed (an element at position zero was
    /// removed or its leaf was merged away); the caller should update the
    /// key recorded for this child, or propagate the new first key further
    /// up if it has no such slot (child index zero).
    NeedsUpdate(K),
    /// The subtree split in two; `middle_key` is the first key of the new
    /// right-hand node and `new_pointer` is where it was stored.
    Split { middle_key: K, new_pointer: P },
}

/// Outcome of [`BTreeBackend::index_shift`]/[`BTreeBackend::leaf_shift`]
/// attempting to rebalance an underfull node against its sibling.
enum ShiftOutcome {
    /// `right` was fully drained into `left`; the caller deletes `right`.
    Merged,
    /// A single element moved across the boundary; both nodes remain and
    /// the caller must recompute the separator key between them.
    Shifted,
    /// Neither merging nor moving an element would help either side.
    Unchanged,
}

/// Storage and node-shape contract the generic algorithm is written
/// against. A concrete backend (e.g. [`block_store::BlockStore`]) owns the
/// actual bytes; this trait only describes how to navigate and mutate
/// nodes once they are in memory.
pub trait BTreeBackend {
    /// Tree key type. Comparisons drive all tree navigation.
    type Key: Ord + Clone;
    /// Value type stored at leaves.
    type Data: Clone;
    /// Opaque handle identifying a stored node (a block index, in the
    /// concrete backend).
    type Pointer: Copy + Eq;
    /// In-memory representation of an index (interior) node.
    type Index;
    /// In-memory representation of a leaf node.
    type Leaf;

    /// Pointer to the current root, or `None` if the tree is empty.
    fn root_pointer(&self) -> Option<Self::Pointer>;
    /// Whether the root is a leaf (true for an empty or single-leaf tree).
    fn root_is_leaf(&self) -> bool;
    /// Commits a new root pointer and kind.
    fn set_new_root(&mut self, pointer: Option<Self::Pointer>, is_leaf: bool) -> Result<()>;

    /// Allocates a fresh, empty index node at the given tree level
    /// (distance from the leaves; leaves' parent index has level 1).
    fn create_index(&mut self, level: u8) -> Self::Index;
    /// Seeds a freshly created, pointer-less index with its first child
    /// pointer (position 0, with no key before it). Used only when
    /// building a brand new root after a split.
    fn index_set_first_pointer(&self, index: &mut Self::Index, pointer: Self::Pointer);
    /// Loads an index node.
    fn load_index(&mut self, pointer: Self::Pointer) -> Result<Self::Index>;
    /// Persists `index`, replacing `old_pointer` if given (copy-on-write:
    /// the backend is responsible for freeing the old node's storage).
    fn store_index(&mut self, old_pointer: Option<Self::Pointer>, index: Self::Index) -> Result<Self::Pointer>;
    /// Frees a node's storage without replacing it (used when a sibling
    /// absorbs a node entirely during a merge).
    fn delete_index(&mut self, pointer: Self::Pointer) -> Result<()>;

    /// Number of child pointers in `index`.
    fn index_pointer_count(&self, index: &Self::Index) -> usize;
    /// Level of `index` (distance to the leaves).
    fn index_level(&self, index: &Self::Index) -> u8;
    /// Child pointer at position `i`.
    fn index_pointer(&self, index: &Self::Index, i: usize) -> Self::Pointer;
    /// Overwrites the child pointer at position `i`.
    fn index_update_pointer(&self, index: &mut Self::Index, i: usize, pointer: Self::Pointer);
    /// The key separating child `i - 1` from child `i`, for `i` in
    /// `1..pointer_count`.
    fn index_key_before(&self, index: &Self::Index, i: usize) -> Self::Key;
    /// Overwrites the key separating child `i - 1` from child `i`.
    fn index_update_key_before(&self, index: &mut Self::Index, i: usize, key: Self::Key);
    /// Removes child `i` and the key separating it from child `i - 1`.
    fn index_remove_before(&self, index: &mut Self::Index, i: usize);
    /// Inserts a new child pointer after position `i`, with `key`
    /// separating it from child `i`.
    fn index_insert_after(&self, index: &mut Self::Index, i: usize, key: Self::Key, pointer: Self::Pointer);
    /// Whether `index` has fewer pointers than the backend's minimum
    /// occupancy and should be shifted or merged with a sibling.
    fn index_needs_shift(&self, index: &Self::Index) -> bool;
    /// Attempts to rebalance `left` and `right`, whichever is actually
    /// underfull, moving a pointer across the fuller side's boundary (or
    /// merging `right` into `left` entirely if the combined size fits).
    /// `mid_key` is the separator currently recorded between them in the
    /// parent index.
    fn index_shift(&self, left: &mut Self::Index, mid_key: &Self::Key, right: &mut Self::Index) -> ShiftOutcome;
    /// Splits `index` if it has grown past capacity, returning the
    /// separator key and the new right-hand sibling.
    fn index_split(&self, index: &mut Self::Index) -> Option<(Self::Key, Self::Index)>;

    /// Allocates a fresh, empty leaf node.
    fn create_leaf(&mut self) -> Self::Leaf;
    /// Loads a leaf node.
    fn load_leaf(&mut self, pointer: Self::Pointer) -> Result<Self::Leaf>;
    /// Persists `leaf`, replacing `old_pointer` if given.
    fn store_leaf(&mut self, old_pointer: Option<Self::Pointer>, leaf: Self::Leaf) -> Result<Self::Pointer>;
    /// Frees a leaf's storage without replacing it.
    fn delete_leaf(&mut self, pointer: Self::Pointer) -> Result<()>;

    /// Number of key/data elements in `leaf`.
    fn leaf_element_count(&self, leaf: &Self::Leaf) -> usize;
    /// Key at position `i`.
    fn leaf_key(&self, leaf: &Self::Leaf, i: usize) -> Self::Key;
    /// Data at position `i`.
    fn leaf_data(&self, leaf: &Self::Leaf, i: usize) -> Self::Data;
    /// Inserts `key`/`data` at position `i`.
    fn leaf_insert(&self, leaf: &mut Self::Leaf, i: usize, key: Self::Key, data: Self::Data);
    /// Removes the element at position `i`.
    fn leaf_remove(&self, leaf: &mut Self::Leaf, i: usize);
    /// Sets the pointer to the next leaf in key order (leaves form a
    /// singly-linked list so range scans don't need to re-descend the
    /// tree).
    fn set_next_leaf(&self, leaf: &mut Self::Leaf, pointer: Option<Self::Pointer>);
    /// Returns the pointer to the next leaf in key order.
    fn next_leaf(&self, leaf: &Self::Leaf) -> Option<Self::Pointer>;
    /// Whether `leaf` has shrunk below the minimum occupancy.
    fn leaf_needs_shift(&self, leaf: &Self::Leaf) -> bool;
    /// Same contract as [`BTreeBackend::index_shift`], for leaves. Leaf
    /// elements carry their own keys, so no separator needs to be passed
    /// in.
    fn leaf_shift(&self, left: &mut Self::Leaf, right: &mut Self::Leaf) -> ShiftOutcome;
    /// Same contract as [`BTreeBackend::index_split`], for leaves.
    fn leaf_split(&self, leaf: &mut Self::Leaf) -> Option<Self::Leaf>;
}

/// A B+ tree backed by any [`BTreeBackend`].
pub struct Tree<B: BTreeBackend> {
    backend: B,
}

impl<B: BTreeBackend> Tree<B> {
    /// Wraps an existing backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns a reference to the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns a mutable reference to the underlying backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Consumes the tree, returning the backend.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Returns whether `key` is present.
    pub fn contains(&mut self, key: &B::Key) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Looks up `key`, returning a clone of its associated data if present.
    pub fn find(&mut self, key: &B::Key) -> Result<Option<B::Data>> {
        let Some(mut pointer) = self.backend.root_pointer() else {
            return Ok(None);
        };
        let mut is_leaf = self.backend.root_is_leaf();

        loop {
            if is_leaf {
                let leaf = self.backend.load_leaf(pointer)?;
                let (i, exact) = self.leaf_find(&leaf, key);
                return Ok(if exact {
                    Some(self.backend.leaf_data(&leaf, i))
                } else {
                    None
                });
            }

            let index = self.backend.load_index(pointer)?;
            let i = self.index_find(&index, key);
            is_leaf = self.backend.index_level(&index) == 1;
            pointer = self.backend.index_pointer(&index, i);
        }
    }

    /// Calls `visitor` with every key/data pair in ascending key order.
    ///
    /// Walks the whole tree via [`BTreeBackend::index_pointer`] rather than
    /// relying solely on [`BTreeBackend::next_leaf`] chaining: a backend is
    /// free to report `None` for every leaf's next pointer (as
    /// [`block_store::BlockStore`] does), and correctness must not depend on
    /// it being present.
    pub fn for_each(&mut self, mut visitor: impl FnMut(&B::Key, &B::Data) -> Result<()>) -> Result<()> {
        let Some(root) = self.backend.root_pointer() else {
            return Ok(());
        };
        self.visit_all(root, self.backend.root_is_leaf(), &mut visitor)
    }

    fn visit_all(
        &mut self,
        pointer: B::Pointer,
        is_leaf: bool,
        visitor: &mut impl FnMut(&B::Key, &B::Data) -> Result<()>,
    ) -> Result<()> {
        if is_leaf {
            let leaf = self.backend.load_leaf(pointer)?;
            for i in 0..self.backend.leaf_element_count(&leaf) {
                visitor(&self.backend.leaf_key(&leaf, i), &self.backend.leaf_data(&leaf, i))?;
            }
            return Ok(());
        }

        let index = self.backend.load_index(pointer)?;
        let child_is_leaf = self.backend.index_level(&index) == 1;
        for i in 0..self.backend.index_pointer_count(&index) {
            let child = self.backend.index_pointer(&index, i);
            self.visit_all(child, child_is_leaf, visitor)?;
        }
        Ok(())
    }

    /// Calls `visitor` with every key/data pair `k` such that
    /// `lower <= k < upper`, in ascending key order. Returns the greatest
    /// key actually visited, or `None` if the range was empty.
    ///
    /// Subtrees whose entire key range falls before `lower` or at/after
    /// `upper` are skipped without being loaded, using the same
    /// lower-bound descent as [`Tree::find`].
    pub fn range(
        &mut self,
        lower: &B::Key,
        upper: &B::Key,
        mut visitor: impl FnMut(&B::Key, &B::Data) -> Result<()>,
    ) -> Result<Option<B::Key>> {
        let Some(root) = self.backend.root_pointer() else {
            return Ok(None);
        };
        let mut last_key = None;
        self.visit_range(root, self.backend.root_is_leaf(), lower, upper, &mut visitor, &mut last_key)?;
        Ok(last_key)
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_range(
        &mut self,
        pointer: B::Pointer,
        is_leaf: bool,
        lower: &B::Key,
        upper: &B::Key,
        visitor: &mut impl FnMut(&B::Key, &B::Data) -> Result<()>,
        last_key: &mut Option<B::Key>,
    ) -> Result<()> {
        if is_leaf {
            let leaf = self.backend.load_leaf(pointer)?;
            let (start, _) = self.leaf_find(&leaf, lower);
            for i in start..self.backend.leaf_element_count(&leaf) {
                let key = self.backend.leaf_key(&leaf, i);
                if key >= *upper {
                    break;
                }
                visitor(&key, &self.backend.leaf_data(&leaf, i))?;
                *last_key = Some(key);
            }
            return Ok(());
        }

        let index = self.backend.load_index(pointer)?;
        let child_is_leaf = self.backend.index_level(&index) == 1;
        let start = self.index_find(&index, lower);
        for i in start..self.backend.index_pointer_count(&index) {
            if i > 0 && self.backend.index_key_before(&index, i) >= *upper {
                break;
            }
            let child = self.backend.index_pointer(&index, i);
            self.visit_range(child, child_is_leaf, lower, upper, visitor, last_key)?;
        }
        Ok(())
    }

    /// Best-effort traversal: visits every key/data pair it can reach,
    /// passing unreadable nodes to `on_error` instead of aborting. Used to
    /// salvage as much of a corrupted tree as possible.
    pub fn recover_all(
        &mut self,
        mut visitor: impl FnMut(&B::Key, &B::Data),
        mut on_error: impl FnMut(crate::Error),
    ) {
        let Some(root) = self.backend.root_pointer() else {
            return;
        };
        self.recover_node(root, self.backend.root_is_leaf(), &mut visitor, &mut on_error);
    }

    fn recover_node(
        &mut self,
        pointer: B::Pointer,
        is_leaf: bool,
        visitor: &mut impl FnMut(&B::Key, &B::Data),
        on_error: &mut impl FnMut(crate::Error),
    ) {
        if is_leaf {
            match self.backend.load_leaf(pointer) {
                Ok(leaf) => {
                    for i in 0..self.backend.leaf_element_count(&leaf) {
                        visitor(&self.backend.leaf_key(&leaf, i), &self.backend.leaf_data(&leaf, i));
                    }
                }
                Err(e) => on_error(e),
            }
            return;
        }

        match self.backend.load_index(pointer) {
            Ok(index) => {
                let child_is_leaf = self.backend.index_level(&index) == 1;
                for i in 0..self.backend.index_pointer_count(&index) {
                    let child = self.backend.index_pointer(&index, i);
                    self.recover_node(child, child_is_leaf, visitor, on_error);
                }
            }
            Err(e) => on_error(e),
        }
    }

    /// Number of levels of index nodes above the leaves (`0` for an empty
    /// or single-leaf tree).
    pub fn index_levels(&mut self) -> Result<u8> {
        let Some(root) = self.backend.root_pointer() else {
            return Ok(0);
        };
        if self.backend.root_is_leaf() {
            return Ok(0);
        }
        let index = self.backend.load_index(root)?;
        Ok(self.backend.index_level(&index))
    }

    fn leftmost_leaf(&mut self, mut pointer: B::Pointer) -> Result<B::Pointer> {
        loop {
            let index = self.backend.load_index(pointer)?;
            let child = self.backend.index_pointer(&index, 0);
            if self.backend.index_level(&index) == 1 {
                return Ok(child);
            }
            pointer = child;
        }
    }

    fn index_find(&self, index: &B::Index, key: &B::Key) -> usize {
        let count = self.backend.index_pointer_count(index);
        if count <= 1 {
            return 0;
        }
        let mut lo = 1;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.backend.index_key_before(index, mid) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo - 1
    }

    fn leaf_find(&self, leaf: &B::Leaf, key: &B::Key) -> (usize, bool) {
        let count = self.backend.leaf_element_count(leaf);
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.backend.leaf_key(leaf, mid) < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = lo < count && self.backend.leaf_key(leaf, lo) == *key;
        (lo, exact)
    }

    /// Inserts or overwrites `key` with `data`.
    pub fn insert(&mut self, key: B::Key, data: B::Data) -> Result<()> {
        self.apply(Action::Insert(key, data))
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&mut self, key: &B::Key) -> Result<bool> {
        let existed = self.contains(key)?;
        self.apply(Action::Remove(key.clone()))?;
        Ok(existed)
    }

    fn apply(&mut self, action: Action<B::Key, B::Data>) -> Result<()> {
        let Some(root) = self.backend.root_pointer() else {
            // Empty tree: the first insert creates a leaf root directly.
            if let Action::Insert(key, data) = action {
                let mut leaf = self.backend.create_leaf();
                self.backend.leaf_insert(&mut leaf, 0, key, data);
                let pointer = self.backend.store_leaf(None, leaf)?;
                self.backend.set_new_root(Some(pointer), true)?;
            }
            return Ok(());
        };

        let root_is_leaf = self.backend.root_is_leaf();
        let (new_root_pointer, result) = if root_is_leaf {
            self.modify_leaf(root, &action)?
        } else {
            self.modify_index(root, &action)?
        };

        match result {
            Modify::Done | Modify::NeedsUpdate(_) => {
                self.backend.set_new_root(Some(new_root_pointer), root_is_leaf)?;
            }
            Modify::NeedsJoin => {
                if root_is_leaf {
                    // A leaf root just shrinks; there is no sibling to merge with.
                    self.backend.set_new_root(Some(new_root_pointer), true)?;
                } else {
                    let index = self.backend.load_index(new_root_pointer)?;
                    if self.backend.index_pointer_count(&index) == 1 {
                        // Collapse: the only remaining child becomes the new root.
                        let only_child = self.backend.index_pointer(&index, 0);
                        let child_is_leaf = self.backend.index_level(&index) == 1;
                        self.backend.delete_index(new_root_pointer)?;
                        self.backend.set_new_root(Some(only_child), child_is_leaf)?;
                    } else {
                        self.backend.set_new_root(Some(new_root_pointer), false)?;
                    }
                }
            }
            Modify::Split { middle_key, new_pointer } => {
                let root_level = if root_is_leaf {
                    0
                } else {
                    let old_root_index = self.backend.load_index(new_root_pointer)?;
                    self.backend.index_level(&old_root_index)
                };
                let mut new_root = self.backend.create_index(root_level + 1);
                // Position 0's pointer is the old root; position 1 the new split sibling.
                self.backend.index_set_first_pointer(&mut new_root, new_root_pointer);
                self.backend.index_insert_after(&mut new_root, 0, middle_key, new_pointer);
                let final_pointer = self.backend.store_index(None, new_root)?;
                self.backend.set_new_root(Some(final_pointer), false)?;
            }
        }

        Ok(())
    }

    fn modify_leaf(&mut self, pointer: B::Pointer, action: &Action<B::Key, B::Data>) -> Result<(B::Pointer, Modify<B::Key, B::Pointer>)> {
        let mut leaf = self.backend.load_leaf(pointer)?;
        let (i, exact) = self.leaf_find(&leaf, action.key());
        let first_key_before = if self.backend.leaf_element_count(&leaf) > 0 {
            Some(self.backend.leaf_key(&leaf, 0))
        } else {
            None
        };

        match action {
            Action::Insert(key, data) => {
                if exact {
                    self.backend.leaf_remove(&mut leaf, i);
                }
                self.backend.leaf_insert(&mut leaf, i, key.clone(), data.clone());
            }
            Action::Remove(_) => {
                if exact {
                    self.backend.leaf_remove(&mut leaf, i);
                }
            }
        }

        if let Some(mut right) = self.backend.leaf_split(&mut leaf) {
            let left_pointer = self.backend.store_leaf(Some(pointer), leaf)?;
            self.backend.set_next_leaf(&mut right, None);
            let right_pointer = self.backend.store_leaf(None, right)?;

            // Re-link left -> right -> (left's old next).
            let mut left_reloaded = self.backend.load_leaf(left_pointer)?;
            let old_next = self.backend.next_leaf(&left_reloaded);
            self.backend.set_next_leaf(&mut left_reloaded, Some(right_pointer));
            let left_pointer = self.backend.store_leaf(Some(left_pointer), left_reloaded)?;
            let mut right_reloaded = self.backend.load_leaf(right_pointer)?;
            self.backend.set_next_leaf(&mut right_reloaded, old_next);
            let right_pointer = self.backend.store_leaf(Some(right_pointer), right_reloaded)?;

            let right_leaf = self.backend.load_leaf(right_pointer)?;
            let middle_key = self.backend.leaf_key(&right_leaf, 0);
            return Ok((
                left_pointer,
                Modify::Split {
                    middle_key,
                    new_pointer: right_pointer,
                },
            ));
        }

        let needs_join = self.backend.leaf_needs_shift(&leaf);
        let new_first_key = if self.backend.leaf_element_count(&leaf) > 0 {
            Some(self.backend.leaf_key(&leaf, 0))
        } else {
            None
        };
        let stored = self.backend.store_leaf(Some(pointer), leaf)?;

        if needs_join {
            return Ok((stored, Modify::NeedsJoin));
        }

        if first_key_before != new_first_key {
            if let Some(new_key) = new_first_key {
                return Ok((stored, Modify::NeedsUpdate(new_key)));
            }
        }

        Ok((stored, Modify::Done))
    }

    fn modify_index(&mut self, pointer: B::Pointer, action: &Action<B::Key, B::Data>) -> Result<(B::Pointer, Modify<B::Key, B::Pointer>)> {
        let mut index = self.backend.load_index(pointer)?;
        let target = self.index_find(&index, action.key());
        let child_pointer = self.backend.index_pointer(&index, target);
        let child_is_leaf = self.backend.index_level(&index) == 1;

        let (new_child_pointer, child_result) = if child_is_leaf {
            self.modify_leaf(child_pointer, action)?
        } else {
            self.modify_index(child_pointer, action)?
        };
        self.backend.index_update_pointer(&mut index, target, new_child_pointer);

        match child_result {
            Modify::Done => {
                let stored = self.backend.store_index(Some(pointer), index)?;
                Ok((stored, Modify::Done))
            }

            Modify::NeedsUpdate(new_key) => {
                if target > 0 {
                    self.backend.index_update_key_before(&mut index, target, new_key);
                    let stored = self.backend.store_index(Some(pointer), index)?;
                    Ok((stored, Modify::Done))
                } else {
                    let stored = self.backend.store_index(Some(pointer), index)?;
                    Ok((stored, Modify::NeedsUpdate(new_key)))
                }
            }

            Modify::Split { middle_key, new_pointer } => {
                self.backend.index_insert_after(&mut index, target, middle_key, new_pointer);
                if let Some((mid_key, right)) = self.backend.index_split(&mut index) {
                    let left_pointer = self.backend.store_index(Some(pointer), index)?;
                    let right_pointer = self.backend.store_index(None, right)?;
                    Ok((
                        left_pointer,
                        Modify::Split {
                            middle_key: mid_key,
                            new_pointer: right_pointer,
                        },
                    ))
                } else {
                    let stored = self.backend.store_index(Some(pointer), index)?;
                    Ok((stored, Modify::Done))
                }
            }

            Modify::NeedsJoin => self.rebalance_child(pointer, index, target, child_is_leaf, new_child_pointer),
        }
    }

    /// `child` at position `target` reported it shrank below its minimum
    /// occupancy. Picks a sibling (preferring `(i-1, i)` when `i` is the
    /// last child, else `(i, i+1)`) and either shifts one element across
    /// or merges the pair, then reports the outcome to our own caller.
    fn rebalance_child(
        &mut self,
        pointer: B::Pointer,
        mut index: B::Index,
        target: usize,
        child_is_leaf: bool,
        child_pointer: B::Pointer,
    ) -> Result<(B::Pointer, Modify<B::Key, B::Pointer>)> {
        let count = self.backend.index_pointer_count(&index);
        let (left_i, right_i) = if target + 1 < count {
            (target, target + 1)
        } else if target > 0 {
            (target - 1, target)
        } else {
            // Only child; nothing to rebalance against, propagate upward.
            self.backend.index_update_pointer(&mut index, target, child_pointer);
            let stored = self.backend.store_index(Some(pointer), index)?;
            return Ok((stored, Modify::NeedsJoin));
        };

        let left_pointer = if left_i == target { child_pointer } else { self.backend.index_pointer(&index, left_i) };
        let right_pointer = if right_i == target { child_pointer } else { self.backend.index_pointer(&index, right_i) };

        if child_is_leaf {
            let mut left = self.backend.load_leaf(left_pointer)?;
            let mut right = self.backend.load_leaf(right_pointer)?;

            match self.backend.leaf_shift(&mut left, &mut right) {
                ShiftOutcome::Merged => {
                    let new_left_pointer = self.backend.store_leaf(Some(left_pointer), left)?;
                    self.backend.index_update_pointer(&mut index, left_i, new_left_pointer);
                    self.backend.delete_leaf(right_pointer)?;
                    self.backend.index_remove_before(&mut index, right_i);
                }
                ShiftOutcome::Shifted => {
                    let new_left_pointer = self.backend.store_leaf(Some(left_pointer), left)?;
                    self.backend.index_update_pointer(&mut index, left_i, new_left_pointer);
                    let new_right_pointer = self.backend.store_leaf(Some(right_pointer), right)?;
                    self.backend.index_update_pointer(&mut index, right_i, new_right_pointer);
                    let new_right_leaf = self.backend.load_leaf(new_right_pointer)?;
                    let new_separator = self.backend.leaf_key(&new_right_leaf, 0);
                    self.backend.index_update_key_before(&mut index, right_i, new_separator);
                }
                // Neither side could help the other; both pointers in
                // `index` already point at the unchanged nodes.
                ShiftOutcome::Unchanged => {}
            }
        } else {
            let mid_key = self.backend.index_key_before(&index, right_i);
            let mut left = self.backend.load_index(left_pointer)?;
            let mut right = self.backend.load_index(right_pointer)?;

            match self.backend.index_shift(&mut left, &mid_key, &mut right) {
                ShiftOutcome::Merged => {
                    let new_left_pointer = self.backend.store_index(Some(left_pointer), left)?;
                    self.backend.index_update_pointer(&mut index, left_i, new_left_pointer);
                    self.backend.delete_index(right_pointer)?;
                    self.backend.index_remove_before(&mut index, right_i);
                }
                ShiftOutcome::Shifted => {
                    let new_left_pointer = self.backend.store_index(Some(left_pointer), left)?;
                    self.backend.index_update_pointer(&mut index, left_i, new_left_pointer);
                    let new_right_pointer = self.backend.store_index(Some(right_pointer), right)?;
                    self.backend.index_update_pointer(&mut index, right_i, new_right_pointer);
                    // The shift changed right's leftmost descendant; refresh
                    // the separator recorded for it, same as the leaf case.
                    let leftmost = self.leftmost_leaf(new_right_pointer)?;
                    let leaf = self.backend.load_leaf(leftmost)?;
                    let new_separator = self.backend.leaf_key(&leaf, 0);
                    self.backend.index_update_key_before(&mut index, right_i, new_separator);
                }
                ShiftOutcome::Unchanged => {}
            }
        }

        if self.backend.index_needs_shift(&index) {
            let stored = self.backend.store_index(Some(pointer), index)?;
            Ok((stored, Modify::NeedsJoin))
        } else {
            let stored = self.backend.store_index(Some(pointer), index)?;
            Ok((stored, Modify::Done))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Trivial in-memory backend used to exercise the generic algorithm in
    /// isolation from any on-disk format. Nodes are identified by a
    /// monotonically increasing counter rather than a block index.
    #[derive(Default)]
    struct MemoryBackend {
        root: Option<u64>,
        root_is_leaf: bool,
        next_id: u64,
        indexes: BTreeMap<u64, MemIndex>,
        leaves: BTreeMap<u64, MemLeaf>,
        max_leaf_elems: usize,
        max_index_pointers: usize,
    }

    #[derive(Clone, Default)]
    struct MemIndex {
        level: u8,
        pointers: Vec<u64>,
        keys: Vec<String>, // keys[i] separates pointers[i] and pointers[i+1]
    }

    #[derive(Clone, Default)]
    struct MemLeaf {
        entries: Vec<(String, String)>,
        next: Option<u64>,
    }

    impl MemoryBackend {
        fn new(max_leaf_elems: usize, max_index_pointers: usize) -> Self {
            Self {
                max_leaf_elems,
                max_index_pointers,
                ..Default::default()
            }
        }

        fn alloc(&mut self) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
    }

    impl BTreeBackend for MemoryBackend {
        type Key = String;
        type Data = String;
        type Pointer = u64;
        type Index = MemIndex;
        type Leaf = MemLeaf;

        fn root_pointer(&self) -> Option<u64> {
            self.root
        }
        fn root_is_leaf(&self) -> bool {
            self.root_is_leaf
        }
        fn set_new_root(&mut self, pointer: Option<u64>, is_leaf: bool) -> Result<()> {
            self.root = pointer;
            self.root_is_leaf = is_leaf;
            Ok(())
        }

        fn create_index(&mut self, level: u8) -> MemIndex {
            MemIndex {
                level,
                pointers: vec![],
                keys: vec![],
            }
        }
        fn load_index(&mut self, pointer: u64) -> Result<MemIndex> {
            Ok(self.indexes.get(&pointer).cloned().unwrap_or_default())
        }
        fn store_index(&mut self, old_pointer: Option<u64>, index: MemIndex) -> Result<u64> {
            if let Some(old) = old_pointer {
                self.indexes.remove(&old);
            }
            let id = self.alloc();
            self.indexes.insert(id, index);
            Ok(id)
        }
        fn delete_index(&mut self, pointer: u64) -> Result<()> {
            self.indexes.remove(&pointer);
            Ok(())
        }

        fn index_set_first_pointer(&self, index: &mut MemIndex, pointer: u64) {
            index.pointers = vec![pointer];
        }
        fn index_pointer_count(&self, index: &MemIndex) -> usize {
            index.pointers.len()
        }
        fn index_level(&self, index: &MemIndex) -> u8 {
            index.level
        }
        fn index_pointer(&self, index: &MemIndex, i: usize) -> u64 {
            index.pointers[i]
        }
        fn index_update_pointer(&self, index: &mut MemIndex, i: usize, pointer: u64) {
            index.pointers[i] = pointer;
        }
        fn index_key_before(&self, index: &MemIndex, i: usize) -> String {
            index.keys[i - 1].clone()
        }
        fn index_update_key_before(&self, index: &mut MemIndex, i: usize, key: String) {
            index.keys[i - 1] = key;
        }
        fn index_remove_before(&self, index: &mut MemIndex, i: usize) {
            index.keys.remove(i - 1);
            index.pointers.remove(i);
        }
        fn index_insert_after(&self, index: &mut MemIndex, i: usize, key: String, pointer: u64) {
            index.keys.insert(i, key);
            index.pointers.insert(i + 1, pointer);
        }
        fn index_needs_shift(&self, index: &MemIndex) -> bool {
            index.pointers.len() < (self.max_index_pointers + 1) / 2
        }
        fn index_shift(&self, left: &mut MemIndex, mid_key: &String, right: &mut MemIndex) -> ShiftOutcome {
            if left.pointers.len() + right.pointers.len() <= self.max_index_pointers {
                left.keys.push(mid_key.clone());
                left.keys.extend(right.keys.drain(..));
                left.pointers.extend(right.pointers.drain(..));
                return ShiftOutcome::Merged;
            }

            if self.index_needs_shift(right) {
                if left.pointers.len() > 1 {
                    // Move left's last pointer in to become right's new
                    // front pointer; left's trailing key is discarded, the
                    // separator passed in bridges the two sides instead.
                    let moved_pointer = left.pointers.pop().expect("checked non-empty");
                    left.keys.pop();
                    right.pointers.insert(0, moved_pointer);
                    right.keys.insert(0, mid_key.clone());
                    return ShiftOutcome::Shifted;
                }
            } else if self.index_needs_shift(left) {
                if right.pointers.len() > 1 {
                    let moved_pointer = right.pointers.remove(0);
                    right.keys.remove(0);
                    left.pointers.push(moved_pointer);
                    left.keys.push(mid_key.clone());
                    return ShiftOutcome::Shifted;
                }
            }

            ShiftOutcome::Unchanged
        }
        fn index_split(&self, index: &mut MemIndex) -> Option<(String, MemIndex)> {
            if index.pointers.len() <= self.max_index_pointers {
                return None;
            }
            let mid = index.pointers.len() / 2;
            let right_pointers = index.pointers.split_off(mid);
            let middle_key = index.keys[mid - 1].clone();
            let right_keys = index.keys.split_off(mid);
            index.keys.truncate(mid - 1);
            Some((
                middle_key,
                MemIndex {
                    level: index.level,
                    pointers: right_pointers,
                    keys: right_keys,
                },
            ))
        }

        fn create_leaf(&mut self) -> MemLeaf {
            MemLeaf::default()
        }
        fn load_leaf(&mut self, pointer: u64) -> Result<MemLeaf> {
            Ok(self.leaves.get(&pointer).cloned().unwrap_or_default())
        }
        fn store_leaf(&mut self, old_pointer: Option<u64>, leaf: MemLeaf) -> Result<u64> {
            if let Some(old) = old_pointer {
                self.leaves.remove(&old);
            }
            let id = self.alloc();
            self.leaves.insert(id, leaf);
            Ok(id)
        }
        fn delete_leaf(&mut self, pointer: u64) -> Result<()> {
            self.leaves.remove(&pointer);
            Ok(())
        }

        fn leaf_element_count(&self, leaf: &MemLeaf) -> usize {
            leaf.entries.len()
        }
        fn leaf_key(&self, leaf: &MemLeaf, i: usize) -> String {
            leaf.entries[i].0.clone()
        }
        fn leaf_data(&self, leaf: &MemLeaf, i: usize) -> String {
            leaf.entries[i].1.clone()
        }
        fn leaf_insert(&self, leaf: &mut MemLeaf, i: usize, key: String, data: String) {
            leaf.entries.insert(i, (key, data));
        }
        fn leaf_remove(&self, leaf: &mut MemLeaf, i: usize) {
            leaf.entries.remove(i);
        }
        fn set_next_leaf(&self, leaf: &mut MemLeaf, pointer: Option<u64>) {
            leaf.next = pointer;
        }
        fn next_leaf(&self, leaf: &MemLeaf) -> Option<u64> {
            leaf.next
        }
        fn leaf_needs_shift(&self, leaf: &MemLeaf) -> bool {
            leaf.entries.len() < (self.max_leaf_elems / 2).max(1)
        }
        fn leaf_shift(&self, left: &mut MemLeaf, right: &mut MemLeaf) -> ShiftOutcome {
            if left.entries.is_empty() || right.entries.is_empty() {
                left.entries.append(&mut right.entries);
                left.next = right.next;
                return ShiftOutcome::Merged;
            }

            if left.entries.len() + right.entries.len() <= self.max_leaf_elems {
                left.entries.append(&mut right.entries);
                left.next = right.next;
                return ShiftOutcome::Merged;
            }

            if self.leaf_needs_shift(right) {
                if let Some(moved) = left.entries.pop() {
                    right.entries.insert(0, moved);
                    return ShiftOutcome::Shifted;
                }
            } else if self.leaf_needs_shift(left) {
                if !right.entries.is_empty() {
                    let moved = right.entries.remove(0);
                    left.entries.push(moved);
                    return ShiftOutcome::Shifted;
                }
            }

            ShiftOutcome::Unchanged
        }
        fn leaf_split(&self, leaf: &mut MemLeaf) -> Option<MemLeaf> {
            if leaf.entries.len() <= self.max_leaf_elems {
                return None;
            }
            let mid = leaf.entries.len() / 2;
            let right_entries = leaf.entries.split_off(mid);
            Some(MemLeaf {
                entries: right_entries,
                next: None,
            })
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{i:05}")).collect()
    }

    #[test]
    fn insert_find_small_tree() {
        let mut tree = Tree::new(MemoryBackend::new(8, 8));
        for k in keys(5) {
            tree.insert(k.clone(), format!("v-{k}")).unwrap();
        }
        for k in keys(5) {
            assert_eq!(tree.find(&k).unwrap(), Some(format!("v-{k}")));
        }
        assert_eq!(tree.find(&"missing".to_string()).unwrap(), None);
    }

    #[test]
    fn insert_triggers_splits_and_for_each_is_sorted() {
        let mut tree = Tree::new(MemoryBackend::new(4, 4));
        let mut expected = keys(200);
        // Insert out of order to exercise mid-tree splits, not just
        // right-edge appends.
        let mut shuffled = expected.clone();
        shuffled.sort_by_key(|k| {
            let n: usize = k.trim_start_matches("key-").parse().unwrap();
            (n * 2654435761) % 200
        });
        for k in &shuffled {
            tree.insert(k.clone(), format!("v-{k}")).unwrap();
        }

        let mut seen = Vec::new();
        tree.for_each(|k, _| {
            seen.push(k.clone());
            Ok(())
        })
        .unwrap();

        expected.sort();
        assert_eq!(seen, expected);
        assert!(tree.index_levels().unwrap() >= 1);
    }

    #[test]
    fn remove_shrinks_tree_and_is_reflected_in_lookups() {
        let mut tree = Tree::new(MemoryBackend::new(4, 4));
        for k in keys(50) {
            tree.insert(k.clone(), format!("v-{k}")).unwrap();
        }
        for (i, k) in keys(50).into_iter().enumerate() {
            if i % 3 == 0 {
                assert!(tree.remove(&k).unwrap());
            }
        }
        for (i, k) in keys(50).into_iter().enumerate() {
            if i % 3 == 0 {
                assert_eq!(tree.find(&k).unwrap(), None);
            } else {
                assert_eq!(tree.find(&k).unwrap(), Some(format!("v-{k}")));
            }
        }
    }

    #[test]
    fn recover_all_visits_readable_nodes() {
        let mut tree = Tree::new(MemoryBackend::new(4, 4));
        for k in keys(20) {
            tree.insert(k.clone(), format!("v-{k}")).unwrap();
        }
        let mut seen = 0;
        let mut errors = 0;
        tree.recover_all(|_, _| seen += 1, |_| errors += 1);
        assert_eq!(seen, 20);
        assert_eq!(errors, 0);
    }
}
