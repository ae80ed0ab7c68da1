//! # Persistence Controller
//!
//! Everything that moves tree state between memory and the three files:
//! the metadata record at block 0, dirty-page write-back, cache warm-up
//! and release, and crash recovery.
//!
//! ## Sync Ordering
//!
//! A flush writes dirty leaves first, then dirty internals, each batch in
//! ascending block order; then the metadata record (still flagged
//! unclean), then the fsync, and only then is the redo log truncated.
//! The clean flag is written exclusively by `close`, after a final flush,
//! and is what admits the fast startup path on the next open.
//!
//! ## Open / Recovery Contract
//!
//! `open` on a clean store immediately re-marks it unclean (so a crash
//! while running is detected) and warms the read cache. An unclean store
//! fails with `InvalidData`; the caller runs `recovery`, which rebuilds
//! the tree in a scratch store from every surviving leaf block, replays
//! the redo log over it, archives the broken files with a
//! `.broken.<timestamp>` suffix and promotes the scratch data file.

use std::fs;

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, info, warn};
use zerocopy::IntoBytes;

use super::leaf::LeafNode;
use super::metadata::{Metadata, METADATA_SIZE};
use super::node::{block_index, Node, NULL_ID};
use super::tree::TreeInner;
use crate::codec::FixedCodec;
use crate::config::{
    BROKEN_SUFFIX, DIRTY_FLUSH_DIVISOR, RECOVER_SUFFIX, REDO_OP_PUT, REDO_OP_REMOVE,
};
use crate::error::StoreError;
use crate::storage::FreeBitmap;

impl<K, V> TreeInner<K, V>
where
    K: FixedCodec + Ord + Clone,
    V: FixedCodec + Clone,
{
    // ===================================== metadata

    pub(crate) fn write_metadata(&mut self, clean: bool) -> Result<()> {
        let meta = Metadata::new(
            self.block_size as u32,
            self.leaf_order as u32,
            self.internal_order as u32,
            self.storage_block,
            self.root_id,
            self.low_id,
            self.high_id,
            self.elements,
            self.height,
            self.max_internal_nodes,
            self.max_leaf_nodes,
            clean,
        );
        let mut buf = self.pool.acquire();
        buf[..METADATA_SIZE].copy_from_slice(meta.as_bytes());
        self.storage
            .write_block(0, &buf)
            .wrap_err("failed to write metadata block")?;

        if clean {
            self.storage.sync()?;
            self.free_blocks
                .write_to_file(&self.free_path)
                .wrap_err("failed to write free-bitmap sidecar")?;
        } else {
            // An unclean store must not admit the fast startup path.
            let _ = fs::remove_file(&self.free_path);
        }
        Ok(())
    }

    /// Load the metadata record, validating magics and that the store was
    /// written with this tree's geometry. Returns the clean flag.
    pub(crate) fn read_metadata(&mut self) -> Result<bool> {
        let buf = self.storage.read_block(0)?;
        let meta = Metadata::from_bytes(&buf)?;

        if meta.block_size.get() as usize != self.block_size {
            return Err(eyre::Report::new(StoreError::InvalidData)).wrap_err_with(|| {
                format!(
                    "invalid metadata (block size) {} != {}",
                    meta.block_size.get(),
                    self.block_size
                )
            });
        }
        if meta.b_order_leaf.get() as usize != self.leaf_order {
            return Err(eyre::Report::new(StoreError::InvalidData)).wrap_err_with(|| {
                format!(
                    "invalid metadata (leaf b-order) {} != {}",
                    meta.b_order_leaf.get(),
                    self.leaf_order
                )
            });
        }
        if meta.b_order_internal.get() as usize != self.internal_order {
            return Err(eyre::Report::new(StoreError::InvalidData)).wrap_err_with(|| {
                format!(
                    "invalid metadata (internal b-order) {} != {}",
                    meta.b_order_internal.get(),
                    self.internal_order
                )
            });
        }

        self.storage_block = meta.storage_block.get();
        self.root_id = meta.root_id.get();
        self.low_id = meta.low_id.get();
        self.high_id = meta.high_id.get();
        self.elements = meta.elements.get();
        self.height = meta.height.get();
        self.max_internal_nodes = meta.max_internal_nodes.get();
        self.max_leaf_nodes = meta.max_leaf_nodes.get();
        self.cache.clear_all();

        let clean = meta.is_clean();
        if clean && self.free_path.exists() {
            match FreeBitmap::read_from_file(&self.free_path) {
                Ok(bitmap) => self.free_blocks = bitmap,
                Err(e) => warn!(error = %e, "ignoring unreadable free-bitmap sidecar"),
            }
        }
        Ok(clean)
    }

    // ===================================== lifecycle

    pub(crate) fn open_op(&mut self) -> Result<bool> {
        ensure!(
            !self.storage.is_open() && !self.redo.is_open(),
            StoreError::InvalidState
        );
        self.storage.open()?;
        self.redo.open()?;

        let mut is_new = false;
        if self.storage.size_in_blocks()? == 0 {
            self.clear_states()?;
            is_new = true;
        }

        match self.open_validate(is_new) {
            Ok(all_right) => {
                self.valid_state = true;
                Ok(all_right)
            }
            Err(e) => {
                self.valid_state = false;
                let _ = self.storage.close();
                let _ = self.redo.close();
                Err(e)
            }
        }
    }

    fn open_validate(&mut self, is_new: bool) -> Result<bool> {
        let clean = self.read_metadata()?;
        if is_new {
            return Ok(false);
        }
        if !clean {
            return Err(eyre::Report::new(StoreError::InvalidData))
                .wrap_err("store was not shut down cleanly; recovery required");
        }
        // Mark unclean while running so a crash is detected next open.
        self.write_metadata(false)?;
        if !self.opts.disable_populate_cache {
            self.populate_cache()?;
        }
        Ok(true)
    }

    pub(crate) fn close_op(&mut self) -> Result<()> {
        if self.storage.is_open() {
            self.flush_dirty(true)?;
            self.write_metadata(true)?;
        }
        self.storage.close()?;
        self.redo.close()?;
        self.cache.clear_all();
        self.valid_state = false;
        Ok(())
    }

    /// Destroy all three files and recreate the empty tree.
    pub(crate) fn clear_op(&mut self) -> Result<()> {
        self.storage.delete()?;
        self.redo.delete()?;
        let _ = fs::remove_file(&self.free_path);
        self.storage.open()?;
        self.redo.open()?;
        self.clear_states()
    }

    /// Reset counters and caches and create a fresh root leaf.
    pub(crate) fn clear_states(&mut self) -> Result<()> {
        self.cache.clear_all();
        self.max_internal_nodes = 0;
        self.max_leaf_nodes = 0;
        self.storage_block = 0;
        self.free_blocks = FreeBitmap::new();

        self.low_id = NULL_ID;
        self.high_id = NULL_ID;
        self.elements = 0;
        self.height = 1;
        let root = self.allocate(true);
        self.root_id = root;
        self.put_node(Node::Leaf(LeafNode::new(root)));

        self.write_metadata(false)?;
        self.valid_state = true;
        self.flush_dirty(true)
    }

    pub(crate) fn sync_op(&mut self) -> Result<()> {
        ensure!(self.valid_state, StoreError::InvalidState);
        self.flush_dirty(true)
    }

    // ===================================== write-back

    /// Write all dirty nodes in ascending block order (leaves first),
    /// refresh the metadata record, and optionally force the store. A
    /// successful forced flush truncates the redo log.
    ///
    /// Page writes are best-effort: a failing page is logged and skipped
    /// so the remaining pages still reach the file.
    pub(crate) fn flush_dirty(&mut self, sync_store: bool) -> Result<()> {
        for leaves in [true, false] {
            for node in self.cache.drain_dirty(leaves) {
                if let Err(e) = self.write_node_block(&node) {
                    warn!(
                        block = block_index(node.id()),
                        error = %e,
                        "failed to flush dirty node"
                    );
                    continue;
                }
                if !node.is_deleted() {
                    self.cache.insert_read(node);
                }
            }
        }
        self.write_metadata(false)?;
        if sync_store {
            self.storage.sync()?;
            if self.opts.use_redo {
                self.redo.truncate()?;
            }
        }
        Ok(())
    }

    /// Serialize one node into its block; tombstoned nodes write a
    /// zero-filled placeholder and return their block to the bitmap.
    fn write_node_block(&mut self, node: &Node<K, V>) -> Result<()> {
        let index = block_index(node.id());
        let mut buf = self.pool.acquire();
        if node.is_deleted() {
            self.free_blocks.set(index);
        } else {
            node.serialize(&mut buf);
        }
        self.storage.write_block(index, &buf)
    }

    // ===================================== cache maintenance

    /// Called after every top-level operation: once the cache exceeds its
    /// node budget, flush the dirty pools (when they hold more than a
    /// tenth of the budget) and evict read-pool overflow, eldest first.
    pub(crate) fn release_nodes(&mut self) -> Result<()> {
        if !self.storage.is_open() {
            return Ok(());
        }
        let max_nodes = self.cache.max_nodes();
        let dirty = self.cache.dirty_len();
        let read = self.cache.read_len();
        if dirty + read < max_nodes {
            return Ok(());
        }

        if dirty >= max_nodes / DIRTY_FLUSH_DIVISOR {
            self.flush_dirty(!self.opts.disable_autosync_store)?;
        }
        let (evicted_leaf, evicted_internal) = self.cache.evict_excess();
        debug!(
            dirty,
            read, evicted_leaf, evicted_internal, "released cached nodes"
        );
        Ok(())
    }

    /// Warm the read pools from disk until either cap fills, marking
    /// undecodable blocks free along the way.
    pub(crate) fn populate_cache(&mut self) -> Result<()> {
        let mut loaded = 0u32;
        for index in 1..self.storage_block {
            if self.cache.read_leaf_len() >= self.cache.cap_leaf()
                || self.cache.read_internal_len() >= self.cache.cap_internal()
            {
                break;
            }
            if self.free_blocks.get(index) {
                continue;
            }
            match self.read_node_from_store(index) {
                Ok(node) => {
                    self.cache.insert_read(node);
                    loaded += 1;
                }
                Err(e) if StoreError::classify(&e) == Some(StoreError::InvalidNode) => {
                    self.free_blocks.set(index);
                }
                Err(e) => return Err(e),
            }
        }
        debug!(loaded, blocks = self.storage_block, "populated read cache");
        Ok(())
    }

    // ===================================== recovery

    pub(crate) fn recovery_op(&mut self) -> Result<()> {
        ensure!(
            !self.storage.is_open() && !self.redo.is_open(),
            StoreError::InvalidState
        );
        self.storage.open()?;
        self.redo.open()?;

        let mut tmp_opts = self.opts.clone();
        tmp_opts.filename = {
            let mut name = self.opts.filename.as_os_str().to_os_string();
            name.push(RECOVER_SUFFIX);
            name.into()
        };
        tmp_opts.use_redo = false;
        tmp_opts.use_redo_thread = false;
        tmp_opts.disable_populate_cache = true;
        let mut tmp: TreeInner<K, V> =
            TreeInner::new(tmp_opts, self.block_size, self.leaf_order, self.internal_order)?;
        tmp.clear_op()?;

        // Phase 1: re-insert every live record found in surviving leaves.
        let blocks = self.storage.size_in_blocks()?;
        info!(blocks, "recovery: scanning data blocks");
        let mut recovered = 0u64;
        for index in 1..blocks {
            match self.read_node_from_store(index) {
                Ok(Node::Leaf(leaf)) => {
                    for (key, value) in leaf.keys.iter().zip(&leaf.values) {
                        tmp.put_op(key, value)?;
                        tmp.release_nodes()?;
                        recovered += 1;
                    }
                }
                Ok(Node::Internal(_)) => {}
                Err(e) if StoreError::classify(&e) == Some(StoreError::InvalidNode) => continue,
                Err(e) => return Err(e),
            }
        }

        // Phase 2: replay the redo log in order.
        let mut buf = Vec::new();
        let mut offset = 0u64;
        let mut replayed = 0u64;
        while let Some(next) = self.redo.read(offset, &mut buf)? {
            offset = next;
            match buf.first().copied() {
                Some(REDO_OP_PUT) if buf.len() >= 1 + K::BYTE_LEN + V::BYTE_LEN => {
                    let key = K::decode(&buf[1..1 + K::BYTE_LEN]);
                    let value = V::decode(&buf[1 + K::BYTE_LEN..1 + K::BYTE_LEN + V::BYTE_LEN]);
                    tmp.put_op(&key, &value)?;
                    tmp.release_nodes()?;
                    replayed += 1;
                }
                Some(REDO_OP_REMOVE) if buf.len() >= 1 + K::BYTE_LEN => {
                    let key = K::decode(&buf[1..1 + K::BYTE_LEN]);
                    tmp.remove_op(&key)?;
                    tmp.release_nodes()?;
                    replayed += 1;
                }
                _ => {} // reserved opcode, skip
            }
        }
        info!(recovered, replayed, "recovery: rebuilt tree");

        tmp.close_op()?;
        self.storage.close()?;
        self.redo.close()?;

        // Archive the broken files and promote the rebuilt store.
        let stamp = chrono::Local::now().format("%Y%m%d.%H%M%S").to_string();
        let archive = |path: &std::path::Path| -> std::path::PathBuf {
            let mut name = path.as_os_str().to_os_string();
            name.push(format!("{}.{}", BROKEN_SUFFIX, stamp));
            name.into()
        };
        fs::rename(&self.data_path, archive(&self.data_path))
            .wrap_err(StoreError::Io)
            .wrap_err("failed to archive broken data file")?;
        fs::rename(&self.redo_path, archive(&self.redo_path))
            .wrap_err(StoreError::Io)
            .wrap_err("failed to archive broken redo file")?;
        fs::rename(&tmp.data_path, &self.data_path)
            .wrap_err(StoreError::Io)
            .wrap_err("failed to promote recovered data file")?;
        let _ = fs::remove_file(&tmp.redo_path);
        let _ = fs::remove_file(&tmp.free_path);
        let _ = fs::remove_file(&self.free_path);
        Ok(())
    }
}
