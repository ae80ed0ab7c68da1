//! # Tree Engine
//!
//! The public `BlockTree` API and the descent algorithms behind it:
//! iterative find-leaf with a traced path, the split cascade on insert,
//! the underflow-repair cascade on remove, root replacement in both
//! directions, endpoint and nearest-key probes, and the ordered iterator.
//!
//! ## Descent and Cascades
//!
//! Mutations descend from the root recording `(internal id, child slot)`
//! pairs. The leaf is changed first; the recorded path is then walked
//! back up:
//!
//! - **Insert**: if the leaf overflowed, its split product bubbles up.
//!   Each parent receives the new separator and child; a parent that
//!   overflows in turn splits and keeps the cascade going. A split that
//!   outlives the path creates a new root and increases the height.
//! - **Remove**: each parent checks the child slot the descent took for
//!   underflow and repairs it by merging with or borrowing from a
//!   sibling. The cascade stops at the first level needing no repair. A
//!   root left with a single child is replaced by it, shrinking the
//!   height.
//!
//! ## Node Ownership
//!
//! The node cache holds the canonical in-memory copy of every node. The
//! engine works on transient clones and publishes every mutation through
//! `put_node`, which lands the clone in the dirty pool. Sibling and child
//! links are plain ids resolved through the cache, never references, so
//! the in-memory shape is exactly the on-disk shape.
//!
//! ## Locking
//!
//! One exclusive lock serializes every public operation. The iterator
//! deliberately re-locks per step (re-descending via `higher_entry`), so
//! it tolerates interleaved mutations without promising a snapshot.

use std::path::PathBuf;

use eyre::{ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::builder::TreeOptions;
use super::cache::NodeCache;
use super::internal::InternalNode;
use super::leaf::LeafNode;
use super::node::{block_index, Node, NULL_ID};
use super::redo::RedoLog;
use crate::codec::{encode_append, FixedCodec};
use crate::config::{REDO_OP_PUT, REDO_OP_REMOVE, TREE_RESET_MIN_BLOCKS};
use crate::error::StoreError;
use crate::storage::{BlockStore, BufferPool, FreeBitmap, SyncCallback};

/// Descent trace: `(internal node id, child slot taken)` per level.
pub(crate) type PathTrace = SmallVec<[(i32, usize); 8]>;

/// A read-only key-value snapshot returned by probes and the iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry<K, V> {
    key: K,
    value: V,
}

impl<K, V> TreeEntry<K, V> {
    pub(crate) fn new(key: K, value: V) -> TreeEntry<K, V> {
        TreeEntry { key, value }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_pair(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// Point-in-time counters for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub elements: u32,
    pub height: u32,
    pub storage_block: u32,
    pub free_blocks: u32,
    pub root_id: i32,
    pub low_id: i32,
    pub high_id: i32,
}

/// Persistent ordered map over fixed-width records.
///
/// All operations are serialized under one exclusive lock; the handle is
/// `Send + Sync` and can be shared across threads.
pub struct BlockTree<K, V> {
    pub(crate) inner: Mutex<TreeInner<K, V>>,
}

pub(crate) struct TreeInner<K, V> {
    pub(crate) opts: TreeOptions,
    pub(crate) block_size: usize,
    pub(crate) leaf_order: usize,
    pub(crate) internal_order: usize,

    pub(crate) valid_state: bool,

    // Metadata mirror, persisted at block 0.
    pub(crate) root_id: i32,
    pub(crate) low_id: i32,
    pub(crate) high_id: i32,
    pub(crate) elements: u32,
    pub(crate) height: u32,
    pub(crate) storage_block: u32,
    pub(crate) max_internal_nodes: u32,
    pub(crate) max_leaf_nodes: u32,

    pub(crate) free_blocks: FreeBitmap,
    pub(crate) storage: BlockStore,
    pub(crate) cache: NodeCache<K, V>,
    pub(crate) redo: RedoLog,
    pub(crate) pool: BufferPool,

    pub(crate) data_path: PathBuf,
    pub(crate) redo_path: PathBuf,
    pub(crate) free_path: PathBuf,
}

fn with_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn finish<T>(result: Result<T>, release: Result<()>) -> Result<T> {
    match (result, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

impl<K, V> TreeInner<K, V>
where
    K: FixedCodec + Ord + Clone,
    V: FixedCodec + Clone,
{
    pub(crate) fn new(
        opts: TreeOptions,
        block_size: usize,
        leaf_order: usize,
        internal_order: usize,
    ) -> Result<TreeInner<K, V>> {
        use crate::config::{DATA_EXT, FREE_EXT, REDO_EXT};

        let data_path = with_suffix(&opts.filename, DATA_EXT);
        let redo_path = with_suffix(&opts.filename, REDO_EXT);
        let free_path = with_suffix(&opts.filename, FREE_EXT);

        let mut storage = BlockStore::new(&data_path, block_size);
        if opts.use_mmap {
            storage.enable_mmap_if_supported()?;
        }
        let mut redo = RedoLog::new(&redo_path, block_size * 2);
        redo.set_use_thread(opts.use_redo_thread);
        let cache = NodeCache::new(opts.cache_bytes, block_size);
        let pool = BufferPool::shared(block_size);

        Ok(TreeInner {
            opts,
            block_size,
            leaf_order,
            internal_order,
            valid_state: false,
            root_id: NULL_ID,
            low_id: NULL_ID,
            high_id: NULL_ID,
            elements: 0,
            height: 0,
            storage_block: 0,
            max_internal_nodes: 0,
            max_leaf_nodes: 0,
            free_blocks: FreeBitmap::new(),
            storage,
            cache,
            redo,
            pool,
            data_path,
            redo_path,
            free_path,
        })
    }

    // ===================================== node management

    /// Allocate a node id, reusing a free block when one exists.
    pub(crate) fn allocate(&mut self, is_leaf: bool) -> i32 {
        let index = match self.free_blocks.next_set_bit(0) {
            Some(index) => {
                self.free_blocks.clear(index);
                index
            }
            None => {
                if is_leaf {
                    self.max_leaf_nodes += 1;
                } else {
                    self.max_internal_nodes += 1;
                }
                self.storage_block += 1;
                self.storage_block
            }
        };
        if is_leaf {
            index as i32
        } else {
            -(index as i32)
        }
    }

    pub(crate) fn get_node(&mut self, id: i32) -> Result<Node<K, V>> {
        ensure!(id != NULL_ID, "dereferenced the null node id");
        if let Some(node) = self.cache.lookup(id) {
            return Ok(node);
        }
        let node = self.read_node_from_store(block_index(id))?;
        self.cache.insert_read(node.clone());
        Ok(node)
    }

    pub(crate) fn read_node_from_store(&mut self, index: u32) -> Result<Node<K, V>> {
        let buf = self.storage.read_block(index)?;
        Node::deserialize(&buf)
    }

    fn get_leaf(&mut self, id: i32) -> Result<LeafNode<K, V>> {
        match self.get_node(id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => {
                eyre::bail!("node {} is internal where a leaf was expected", id)
            }
        }
    }

    fn get_internal(&mut self, id: i32) -> Result<InternalNode<K>> {
        match self.get_node(id)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => {
                eyre::bail!("node {} is a leaf where an internal node was expected", id)
            }
        }
    }

    pub(crate) fn put_node(&mut self, node: Node<K, V>) {
        self.cache.set_dirty(node);
    }

    /// Tombstone a node; the next flush zero-fills its block and returns
    /// the index to the free bitmap.
    pub(crate) fn free_node(&mut self, mut node: Node<K, V>) {
        node.mark_deleted();
        self.put_node(node);
    }

    // ===================================== descent

    /// Walk to the leaf that can hold `key`, optionally recording the
    /// internal nodes and child slots taken.
    fn find_leaf(&mut self, key: &K, mut trace: Option<&mut PathTrace>) -> Result<LeafNode<K, V>> {
        if let Some(path) = &mut trace {
            path.clear();
        }
        let mut node = self.get_node(self.root_id)?;
        loop {
            match node {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Internal(internal) => {
                    let slot = internal.find_child_slot(key);
                    if let Some(path) = &mut trace {
                        path.push((internal.id, slot));
                    }
                    node = self.get_node(internal.children[slot])?;
                }
            }
        }
    }

    /// Leftmost or rightmost leaf, through `low_id`/`high_id` when set.
    fn find_side_leaf(&mut self, low: bool) -> Result<Option<LeafNode<K, V>>> {
        if self.elements == 0 {
            return Ok(None);
        }
        let side = if low { self.low_id } else { self.high_id };
        let mut node = self.get_node(if side == NULL_ID { self.root_id } else { side })?;
        loop {
            match node {
                Node::Leaf(leaf) => return Ok(Some(leaf)),
                Node::Internal(internal) => {
                    let child = if low {
                        internal.children[0]
                    } else {
                        *internal.children.last().unwrap()
                    };
                    node = self.get_node(child)?;
                }
            }
        }
    }

    // ===================================== lookups

    pub(crate) fn get_op(&mut self, key: &K) -> Result<Option<V>> {
        ensure!(self.valid_state, StoreError::InvalidState);
        if self.elements == 0 {
            return Ok(None);
        }
        let leaf = self.find_leaf(key, None)?;
        Ok(match leaf.find_slot(key) {
            Ok(slot) => Some(leaf.values[slot].clone()),
            Err(_) => None,
        })
    }

    pub(crate) fn first_entry_op(&mut self) -> Result<Option<TreeEntry<K, V>>> {
        ensure!(self.valid_state, StoreError::InvalidState);
        Ok(self.find_side_leaf(true)?.map(|leaf| {
            TreeEntry::new(leaf.keys[0].clone(), leaf.values[0].clone())
        }))
    }

    pub(crate) fn last_entry_op(&mut self) -> Result<Option<TreeEntry<K, V>>> {
        ensure!(self.valid_state, StoreError::InvalidState);
        Ok(self.find_side_leaf(false)?.map(|leaf| {
            let slot = leaf.allocated() - 1;
            TreeEntry::new(leaf.keys[slot].clone(), leaf.values[slot].clone())
        }))
    }

    /// Nearest-key probe shared by ceiling/floor/higher/lower: locate the
    /// leaf, adjust the slot by direction and equality-acceptance, and
    /// cross to a sibling when the slot falls off either end.
    pub(crate) fn round_entry_op(
        &mut self,
        key: &K,
        up: bool,
        accept_equal: bool,
    ) -> Result<Option<TreeEntry<K, V>>> {
        ensure!(self.valid_state, StoreError::InvalidState);
        if self.elements == 0 {
            return Ok(None);
        }
        let mut leaf = self.find_leaf(key, None)?;
        let slot = if up {
            let slot = match leaf.find_slot(key) {
                Ok(slot) => {
                    if accept_equal {
                        slot
                    } else {
                        slot + 1
                    }
                }
                Err(insert) => insert,
            };
            if slot >= leaf.allocated() {
                if leaf.right_id == NULL_ID {
                    return Ok(None);
                }
                leaf = self.get_leaf(leaf.right_id)?;
                0
            } else {
                slot
            }
        } else {
            let slot = match leaf.find_slot(key) {
                Ok(slot) => {
                    if accept_equal {
                        slot as isize
                    } else {
                        slot as isize - 1
                    }
                }
                Err(insert) => insert as isize - 1,
            };
            if slot < 0 {
                if leaf.left_id == NULL_ID {
                    return Ok(None);
                }
                leaf = self.get_leaf(leaf.left_id)?;
                leaf.allocated() - 1
            } else {
                slot as usize
            }
        };
        Ok(Some(TreeEntry::new(
            leaf.keys[slot].clone(),
            leaf.values[slot].clone(),
        )))
    }

    // ===================================== mutation

    /// Insert or update. Returns `false` when an existing value was
    /// replaced.
    pub(crate) fn put_op(&mut self, key: &K, value: &V) -> Result<bool> {
        ensure!(self.valid_state, StoreError::InvalidState);
        let mut path = PathTrace::new();
        let mut leaf = self.find_leaf(key, Some(&mut path))?;

        let slot = match leaf.find_slot(key) {
            Ok(slot) => {
                leaf.update(slot, value.clone());
                self.put_node(Node::Leaf(leaf));
                self.submit_redo_put(key, value)?;
                return Ok(false);
            }
            Err(slot) => slot,
        };

        leaf.insert(slot, key.clone(), value.clone());
        self.put_node(Node::Leaf(leaf.clone()));
        self.submit_redo_put(key, value)?;

        let mut pending = if leaf.allocated() >= self.leaf_order {
            Some(self.split_leaf(&mut leaf)?)
        } else {
            None
        };

        // Walk the recorded path back up, inserting separators and
        // splitting overflowing parents.
        while let Some((parent_id, child_slot)) = path.pop() {
            let Some(mut high) = pending.take() else {
                break;
            };
            let separator = high.split_shift_keys_left();
            let high_id = high.id();
            self.put_node(high);

            let mut parent = self.get_internal(parent_id)?;
            parent.insert(child_slot, separator, high_id);
            self.put_node(Node::Internal(parent.clone()));

            if parent.allocated() >= self.internal_order {
                pending = Some(Node::Internal(self.split_internal(&mut parent)?));
            }
        }

        // The ascent split the root: grow the tree by one level.
        if let Some(mut high) = pending {
            let separator = high.split_shift_keys_left();
            let high_id = high.id();
            self.put_node(high);

            let mut new_root = InternalNode::new(self.allocate(false));
            new_root.children.push(self.root_id);
            new_root.keys.push(separator);
            new_root.children.push(high_id);
            self.root_id = new_root.id;
            self.height += 1;
            self.put_node(Node::Internal(new_root));
        }

        self.elements += 1;
        Ok(true)
    }

    /// Split an overflowing leaf, splice the sibling list around the new
    /// high node and maintain the tree endpoints.
    fn split_leaf(&mut self, leaf: &mut LeafNode<K, V>) -> Result<Node<K, V>> {
        let mut high = leaf.split();
        high.id = self.allocate(true);
        high.left_id = leaf.id;
        high.right_id = leaf.right_id;

        if leaf.right_id != NULL_ID {
            let mut old_high = self.get_leaf(leaf.right_id)?;
            old_high.left_id = high.id;
            self.put_node(Node::Leaf(old_high));
        }
        leaf.right_id = high.id;

        if leaf.left_id == NULL_ID {
            self.low_id = leaf.id;
        }
        if high.right_id == NULL_ID {
            self.high_id = high.id;
        }

        self.put_node(Node::Leaf(leaf.clone()));
        self.put_node(Node::Leaf(high.clone()));
        Ok(Node::Leaf(high))
    }

    fn split_internal(&mut self, node: &mut InternalNode<K>) -> Result<InternalNode<K>> {
        let mut high = node.split();
        high.id = self.allocate(false);
        self.put_node(Node::Internal(node.clone()));
        self.put_node(Node::Internal(high.clone()));
        Ok(high)
    }

    /// Delete `key` if present.
    pub(crate) fn remove_op(&mut self, key: &K) -> Result<bool> {
        ensure!(self.valid_state, StoreError::InvalidState);
        let mut path = PathTrace::new();
        let mut leaf = self.find_leaf(key, Some(&mut path))?;

        let slot = match leaf.find_slot(key) {
            Ok(slot) => slot,
            Err(_) => return Ok(false),
        };
        leaf.remove(slot);
        self.put_node(Node::Leaf(leaf));
        self.submit_redo_remove(key)?;

        // Walk back up repairing underflow until a level needs nothing.
        while let Some((parent_id, child_slot)) = path.pop() {
            if !self.check_underflow(parent_id, child_slot)? {
                break;
            }
        }

        self.elements -= 1;

        let root = self.get_node(self.root_id)?;
        if root.is_empty() && self.elements > 0 {
            // The root kept a single child: promote it.
            if let Node::Internal(old_root) = &root {
                let new_root = old_root.children[0];
                self.free_node(root);
                self.root_id = new_root;
                self.height -= 1;
            }
        } else if root.is_empty()
            && root.is_leaf()
            && self.elements == 0
            && self.storage_block > TREE_RESET_MIN_BLOCKS
        {
            // Emptying a large store: reset outright to reclaim space.
            self.clear_op()?;
        }
        Ok(true)
    }

    /// Inspect `children[child_slot]` of the parent and repair underflow
    /// by merging with or borrowing from a sibling. The right sibling is
    /// used for the first slot, the left sibling otherwise. Returns
    /// whether a repair happened (the cascade continues upward on true).
    fn check_underflow(&mut self, parent_id: i32, child_slot: usize) -> Result<bool> {
        let mut parent = self.get_internal(parent_id)?;
        let Some(&child_id) = parent.children.get(child_slot) else {
            return Ok(false);
        };
        if child_id == NULL_ID || parent.keys.is_empty() {
            return Ok(false);
        }

        let under = match self.get_node(child_id)? {
            Node::Leaf(leaf) => leaf.is_under_flow(self.leaf_order),
            Node::Internal(node) => node.is_under_flow(self.internal_order),
        };
        if !under {
            return Ok(false);
        }

        // Pair (left, right) around one separator; the under-full node is
        // children[child_slot], its sibling the other half of the pair.
        let separator_slot = if child_slot == 0 { 0 } else { child_slot - 1 };
        let left_id = parent.children[separator_slot];
        let right_id = parent.children[separator_slot + 1];

        let left = self.get_node(left_id)?;
        let right = self.get_node(right_id)?;

        match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(mut right)) => {
                if left.can_merge(&right, self.leaf_order) {
                    left.merge_from(&mut right);
                    self.splice_after_merge(&mut left, right.id)?;
                    parent.remove(separator_slot);
                    self.free_node(Node::Leaf(right));
                    self.put_node(Node::Leaf(left));
                } else {
                    let mut separator = parent.keys[separator_slot].clone();
                    if child_slot == 0 {
                        left.shift_from_right(&mut separator, &mut right);
                    } else {
                        right.shift_from_left(&mut separator, &mut left);
                    }
                    parent.keys[separator_slot] = separator;
                    self.put_node(Node::Leaf(left));
                    self.put_node(Node::Leaf(right));
                }
            }
            (Node::Internal(mut left), Node::Internal(mut right)) => {
                if left.can_merge(&right, self.internal_order) {
                    let separator = parent.keys[separator_slot].clone();
                    left.merge_from(separator, &mut right);
                    parent.remove(separator_slot);
                    self.free_node(Node::Internal(right));
                    self.put_node(Node::Internal(left));
                } else {
                    let mut separator = parent.keys[separator_slot].clone();
                    if child_slot == 0 {
                        left.shift_from_right(&mut separator, &mut right);
                    } else {
                        right.shift_from_left(&mut separator, &mut left);
                    }
                    parent.keys[separator_slot] = separator;
                    self.put_node(Node::Internal(left));
                    self.put_node(Node::Internal(right));
                }
            }
            _ => eyre::bail!(
                "siblings {} and {} disagree on node kind",
                left_id,
                right_id
            ),
        }

        self.put_node(Node::Internal(parent));
        Ok(true)
    }

    /// After a leaf merge the surviving node inherits the absorbed
    /// sibling's right link; fix the back-pointer and the endpoints.
    fn splice_after_merge(&mut self, left: &mut LeafNode<K, V>, absorbed_id: i32) -> Result<()> {
        let absorbed = self.get_leaf(absorbed_id)?;
        left.right_id = absorbed.right_id;
        if absorbed.right_id != NULL_ID {
            let mut right_of_absorbed = self.get_leaf(absorbed.right_id)?;
            right_of_absorbed.left_id = left.id;
            self.put_node(Node::Leaf(right_of_absorbed));
        }
        if left.left_id == NULL_ID {
            self.low_id = left.id;
        }
        if left.right_id == NULL_ID {
            self.high_id = left.id;
        }
        Ok(())
    }

    pub(crate) fn poll_first_op(&mut self) -> Result<Option<TreeEntry<K, V>>> {
        let entry = self.first_entry_op()?;
        if let Some(entry) = &entry {
            self.remove_op(entry.key())?;
        }
        Ok(entry)
    }

    pub(crate) fn poll_last_op(&mut self) -> Result<Option<TreeEntry<K, V>>> {
        let entry = self.last_entry_op()?;
        if let Some(entry) = &entry {
            self.remove_op(entry.key())?;
        }
        Ok(entry)
    }

    // ===================================== redo submission

    fn submit_redo_put(&mut self, key: &K, value: &V) -> Result<()> {
        if !self.opts.use_redo {
            return Ok(());
        }
        let mut record = Vec::with_capacity(1 + K::BYTE_LEN + V::BYTE_LEN);
        record.push(REDO_OP_PUT);
        encode_append(key, &mut record);
        encode_append(value, &mut record);
        self.redo.submit(record)
    }

    fn submit_redo_remove(&mut self, key: &K) -> Result<()> {
        if !self.opts.use_redo {
            return Ok(());
        }
        let mut record = Vec::with_capacity(1 + K::BYTE_LEN);
        record.push(REDO_OP_REMOVE);
        encode_append(key, &mut record);
        self.redo.submit(record)
    }

    // ===================================== accessors

    pub(crate) fn stats(&self) -> TreeStats {
        TreeStats {
            elements: self.elements,
            height: if self.elements == 0 { 0 } else { self.height },
            storage_block: self.storage_block,
            free_blocks: self.free_blocks.cardinality(),
            root_id: self.root_id,
            low_id: self.low_id,
            high_id: self.high_id,
        }
    }
}

// ===================================== public handle

impl<K, V> BlockTree<K, V>
where
    K: FixedCodec + Ord + Clone,
    V: FixedCodec + Clone,
{
    /// Read the metadata record and enter the opened state. Returns
    /// `true` when the store was clean and the cache was warmed; `false`
    /// for a freshly created store. An unclean store fails with
    /// [`StoreError::InvalidData`]: run [`recovery`](Self::recovery).
    pub fn open(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        let result = inner.open_op();
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Flush everything, write the metadata record clean, and close the
    /// underlying files. Idempotent per open.
    pub fn close(&self) -> Result<()> {
        self.inner.lock().close_op()
    }

    /// Initialize an empty tree, destroying any previous content.
    pub fn create(&self) -> Result<()> {
        self.inner.lock().clear_op()
    }

    /// Truncate data and redo and recreate the empty root leaf.
    pub fn clear(&self) -> Result<()> {
        self.inner.lock().clear_op()
    }

    /// Rebuild a crashed store: scan every surviving leaf block, re-insert
    /// the live records, replay the redo log, and swap the rebuilt files
    /// into place. The broken originals are archived with a
    /// `.broken.<timestamp>` suffix. The tree is left closed.
    pub fn recovery(&self) -> Result<()> {
        self.inner.lock().recovery_op()
    }

    /// Insert or update; `false` means an existing value was replaced.
    pub fn put(&self, key: &K, value: &V) -> Result<bool> {
        let mut inner = self.inner.lock();
        let result = inner.put_op(key, value);
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut inner = self.inner.lock();
        let result = inner.get_op(key);
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Delete a key; `true` if it was present.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let mut inner = self.inner.lock();
        let result = inner.remove_op(key);
        let release = inner.release_nodes();
        finish(result, release)
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        Ok(self.first_entry()?.map(|e| e.into_pair().0))
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        Ok(self.last_entry()?.map(|e| e.into_pair().0))
    }

    pub fn first_entry(&self) -> Result<Option<TreeEntry<K, V>>> {
        let mut inner = self.inner.lock();
        let result = inner.first_entry_op();
        let release = inner.release_nodes();
        finish(result, release)
    }

    pub fn last_entry(&self) -> Result<Option<TreeEntry<K, V>>> {
        let mut inner = self.inner.lock();
        let result = inner.last_entry_op();
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Least key greater than or equal to `key`.
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        Ok(self.ceiling_entry(key)?.map(|e| e.into_pair().0))
    }

    /// Greatest key less than or equal to `key`.
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        Ok(self.floor_entry(key)?.map(|e| e.into_pair().0))
    }

    /// Least key strictly greater than `key`.
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        Ok(self.higher_entry(key)?.map(|e| e.into_pair().0))
    }

    /// Greatest key strictly less than `key`.
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        Ok(self.lower_entry(key)?.map(|e| e.into_pair().0))
    }

    pub fn ceiling_entry(&self, key: &K) -> Result<Option<TreeEntry<K, V>>> {
        self.round_entry(key, true, true)
    }

    pub fn floor_entry(&self, key: &K) -> Result<Option<TreeEntry<K, V>>> {
        self.round_entry(key, false, true)
    }

    pub fn higher_entry(&self, key: &K) -> Result<Option<TreeEntry<K, V>>> {
        self.round_entry(key, true, false)
    }

    pub fn lower_entry(&self, key: &K) -> Result<Option<TreeEntry<K, V>>> {
        self.round_entry(key, false, false)
    }

    fn round_entry(&self, key: &K, up: bool, accept_equal: bool) -> Result<Option<TreeEntry<K, V>>> {
        let mut inner = self.inner.lock();
        let result = inner.round_entry_op(key, up, accept_equal);
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Atomically read and remove the first entry.
    pub fn poll_first_entry(&self) -> Result<Option<TreeEntry<K, V>>> {
        let mut inner = self.inner.lock();
        let result = inner.poll_first_op();
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Atomically read and remove the last entry.
    pub fn poll_last_entry(&self) -> Result<Option<TreeEntry<K, V>>> {
        let mut inner = self.inner.lock();
        let result = inner.poll_last_op();
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Force write-back of all dirty pages and truncate the redo log.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let result = inner.sync_op();
        let release = inner.release_nodes();
        finish(result, release)
    }

    /// Callback invoked after every successful block-store and redo-log
    /// fsync, with the committed size.
    pub fn set_callback(&self, callback: Option<SyncCallback>) {
        let mut inner = self.inner.lock();
        inner.storage.set_callback(callback.clone());
        inner.redo.set_callback(callback);
    }

    pub fn size(&self) -> Result<usize> {
        let inner = self.inner.lock();
        ensure!(inner.valid_state, StoreError::InvalidState);
        Ok(inner.elements as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Height of the tree; zero when empty.
    pub fn height(&self) -> Result<u32> {
        let inner = self.inner.lock();
        ensure!(inner.valid_state, StoreError::InvalidState);
        Ok(if inner.elements == 0 { 0 } else { inner.height })
    }

    pub fn stats(&self) -> Result<TreeStats> {
        let inner = self.inner.lock();
        ensure!(inner.valid_state, StoreError::InvalidState);
        Ok(inner.stats())
    }

    /// Ordered forward iterator of entry snapshots. The iterator
    /// re-descends between steps, so concurrent mutation is tolerated but
    /// not snapshot-isolated: entries may be missed or repeated at the
    /// boundary.
    pub fn iter(&self) -> TreeIter<'_, K, V> {
        TreeIter {
            tree: self,
            last: None,
        }
    }
}

impl<K, V> BlockTree<K, V>
where
    K: FixedCodec + Ord + Clone + std::fmt::Debug,
    V: FixedCodec + Clone + std::fmt::Debug,
{
    /// Write a human-readable listing of every live block.
    pub fn dump<W: std::io::Write>(&self, out: &mut W) -> Result<()> {
        let mut inner = self.inner.lock();
        let result = inner.dump_op(out);
        let release = inner.release_nodes();
        finish(result, release)
    }
}

impl<K, V> TreeInner<K, V>
where
    K: FixedCodec + Ord + Clone + std::fmt::Debug,
    V: FixedCodec + Clone + std::fmt::Debug,
{
    fn dump_op<W: std::io::Write>(&mut self, out: &mut W) -> Result<()> {
        use eyre::WrapErr;

        ensure!(self.valid_state, StoreError::InvalidState);
        writeln!(out, "#ID\tNode").wrap_err("failed to write dump header")?;
        let root_id = self.root_id;
        let id_mark = move |id: i32| if id == root_id { "R" } else { "" };
        for index in 1..self.storage_block {
            if self.free_blocks.get(index) {
                continue;
            }
            match self.read_node_from_store(index) {
                Ok(Node::Leaf(leaf)) => {
                    writeln!(out, "{}{}\t{}", index, id_mark(leaf.id), leaf.describe())
                        .wrap_err("failed to write dump line")?;
                }
                Ok(Node::Internal(node)) => {
                    writeln!(out, "{}{}\t{}", index, id_mark(node.id), node.describe())
                        .wrap_err("failed to write dump line")?;
                }
                Err(e) if StoreError::classify(&e) == Some(StoreError::InvalidNode) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ===================================== iterator

/// Ordered forward iterator over [`TreeEntry`] snapshots.
///
/// Each step takes the tree lock, re-descending via the nearest-key probe
/// from the last returned key.
pub struct TreeIter<'a, K, V> {
    tree: &'a BlockTree<K, V>,
    last: Option<K>,
}

impl<K, V> Iterator for TreeIter<'_, K, V>
where
    K: FixedCodec + Ord + Clone,
    V: FixedCodec + Clone,
{
    type Item = Result<TreeEntry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = match &self.last {
            None => self.tree.first_entry(),
            Some(last) => self.tree.higher_entry(last),
        };
        match step {
            Ok(Some(entry)) => {
                self.last = Some(entry.key().clone());
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<'a, K, V> IntoIterator for &'a BlockTree<K, V>
where
    K: FixedCodec + Ord + Clone,
    V: FixedCodec + Clone,
{
    type Item = Result<TreeEntry<K, V>>;
    type IntoIter = TreeIter<'a, K, V>;

    fn into_iter(self) -> TreeIter<'a, K, V> {
        self.iter()
    }
}
