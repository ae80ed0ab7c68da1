//! # Tree Builder
//!
//! Configuration front door for [`BlockTree`]. All options apply before
//! `open`; `build` validates them, derives the node orders and block
//! size, and assembles the closed tree.
//!
//! ## Sizing Modes
//!
//! - **auto-tune** (default): `b_size` is the block size in bytes. The
//!   builder finds, per node kind, the largest odd b-order whose
//!   serialized node still fits the block.
//! - **fixed order**: `b_size` is the b-order itself (rounded up to odd,
//!   floored at [`MIN_B_ORDER`]); the block size becomes the serialized
//!   node size rounded up to a whole number of sectors.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};
use parking_lot::Mutex;
use tracing::debug;

use super::tree::{BlockTree, TreeInner};
use crate::codec::FixedCodec;
use crate::config::{
    DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BYTES, MIN_B_ORDER, MIN_CACHE_BYTES,
};

/// Options remembered by the tree for its whole life (recovery rebuilds a
/// scratch tree from the same set).
#[derive(Debug, Clone)]
pub(crate) struct TreeOptions {
    pub filename: PathBuf,
    pub b_size: usize,
    pub auto_tune: bool,
    pub cache_bytes: usize,
    pub use_redo: bool,
    pub use_redo_thread: bool,
    pub disable_populate_cache: bool,
    pub disable_autosync_store: bool,
    pub use_mmap: bool,
}

/// Builder for [`BlockTree`].
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    opts: TreeOptions,
}

impl TreeBuilder {
    /// `filename` is the base path; the tree appends `.data`, `.redo` and
    /// `.free` to it.
    pub fn new<P: AsRef<Path>>(filename: P) -> TreeBuilder {
        TreeBuilder {
            opts: TreeOptions {
                filename: filename.as_ref().to_path_buf(),
                b_size: DEFAULT_BLOCK_SIZE,
                auto_tune: true,
                cache_bytes: DEFAULT_CACHE_BYTES,
                use_redo: true,
                use_redo_thread: false,
                disable_populate_cache: false,
                disable_autosync_store: false,
                use_mmap: false,
            },
        }
    }

    /// With auto-tune (default) this is the block size in bytes; without
    /// it, the b-order for both node kinds.
    pub fn b_size(mut self, b_size: usize) -> TreeBuilder {
        self.opts.b_size = b_size;
        self
    }

    pub fn auto_tune(mut self, auto_tune: bool) -> TreeBuilder {
        self.opts.auto_tune = auto_tune;
        self
    }

    /// Soft cap on cached node bytes; floored at 1 KiB.
    pub fn cache_bytes(mut self, cache_bytes: usize) -> TreeBuilder {
        self.opts.cache_bytes = cache_bytes.max(MIN_CACHE_BYTES);
        self
    }

    pub fn use_redo(mut self, use_redo: bool) -> TreeBuilder {
        self.opts.use_redo = use_redo;
        self
    }

    /// Route redo appends through a dedicated writer thread.
    pub fn use_redo_thread(mut self, use_redo_thread: bool) -> TreeBuilder {
        self.opts.use_redo_thread = use_redo_thread;
        self
    }

    /// Skip the read-cache warm-up on clean open.
    pub fn disable_populate_cache(mut self, disable: bool) -> TreeBuilder {
        self.opts.disable_populate_cache = disable;
        self
    }

    /// Suppress the block-store fsync when a release pass flushes dirty
    /// pages. `sync` and `close` still force unconditionally.
    pub fn disable_autosync_store(mut self, disable: bool) -> TreeBuilder {
        self.opts.disable_autosync_store = disable;
        self
    }

    /// Use segmented memory mapping for block access (64-bit hosts).
    pub fn mmap(mut self, use_mmap: bool) -> TreeBuilder {
        self.opts.use_mmap = use_mmap;
        self
    }

    /// Validate the options and assemble a closed tree.
    pub fn build<K, V>(self) -> Result<BlockTree<K, V>>
    where
        K: FixedCodec + Ord + Clone,
        V: FixedCodec + Clone,
    {
        ensure!(K::BYTE_LEN > 0, "key codec must have a non-zero width");
        ensure!(V::BYTE_LEN > 0, "value codec must have a non-zero width");

        let (block_size, leaf_order, internal_order) = derive_geometry::<K, V>(&self.opts)?;
        debug!(
            block_size,
            leaf_order, internal_order, "derived tree geometry"
        );

        let inner = TreeInner::new(self.opts, block_size, leaf_order, internal_order)?;
        Ok(BlockTree {
            inner: Mutex::new(inner),
        })
    }
}

fn derive_geometry<K: FixedCodec, V: FixedCodec>(
    opts: &TreeOptions,
) -> Result<(usize, usize, usize)> {
    use super::internal::InternalNode;
    use super::leaf::LeafNode;

    let leaf_est = LeafNode::<K, V>::struct_estimate_size;
    let internal_est = InternalNode::<K>::struct_estimate_size;

    if opts.auto_tune {
        let min_node = leaf_est(MIN_B_ORDER).max(internal_est(MIN_B_ORDER));
        // A block must hold at least a minimal-order node.
        let block_size = if min_node > opts.b_size {
            round_up(min_node, opts.b_size.max(1))
        } else {
            opts.b_size
        };
        let leaf_order = largest_odd_order(block_size, leaf_est);
        let internal_order = largest_odd_order(block_size, internal_est);
        ensure!(
            leaf_order >= MIN_B_ORDER && internal_order >= MIN_B_ORDER,
            "block size {} cannot hold a node of order {}",
            block_size,
            MIN_B_ORDER
        );
        Ok((block_size, leaf_order, internal_order))
    } else {
        let mut order = opts.b_size.max(MIN_B_ORDER);
        order += 1 - (order % 2); // round odd
        let node_size = leaf_est(order).max(internal_est(order));
        let block_size = round_up(node_size, DEFAULT_BLOCK_SIZE);
        Ok((block_size, order, order))
    }
}

/// Largest odd order whose estimated node size fits the block.
fn largest_odd_order(block_size: usize, est: impl Fn(usize) -> usize) -> usize {
    let mut order = MIN_B_ORDER;
    if est(order) > block_size {
        return 0;
    }
    while est(order + 2) <= block_size {
        order += 2;
    }
    order
}

fn round_up(size: usize, unit: usize) -> usize {
    size.div_ceil(unit) * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(b_size: usize, auto_tune: bool) -> TreeOptions {
        TreeOptions {
            filename: PathBuf::from("/tmp/x"),
            b_size,
            auto_tune,
            cache_bytes: DEFAULT_CACHE_BYTES,
            use_redo: true,
            use_redo_thread: false,
            disable_populate_cache: false,
            disable_autosync_store: false,
            use_mmap: false,
        }
    }

    #[test]
    fn auto_tune_finds_largest_odd_orders() {
        // i64 keys and values: leaf(b) = 6 + 16b + 8, internal(b) = 6 + 12b + 4.
        let (block, leaf, internal) = derive_geometry::<i64, i64>(&opts(512, true)).unwrap();

        assert_eq!(block, 512);
        assert!(leaf % 2 == 1 && internal % 2 == 1);
        assert!(6 + 16 * leaf + 8 <= 512);
        assert!(6 + 16 * (leaf + 2) + 8 > 512);
        assert!(6 + 12 * internal + 4 <= 512);
        assert!(6 + 12 * (internal + 2) + 4 > 512);
    }

    #[test]
    fn auto_tune_grows_undersized_blocks() {
        // 64 bytes cannot hold an order-5 node of i64 pairs.
        let (block, leaf, internal) = derive_geometry::<i64, i64>(&opts(64, true)).unwrap();

        assert_eq!(block % 64, 0);
        assert!(leaf >= MIN_B_ORDER && internal >= MIN_B_ORDER);
    }

    #[test]
    fn fixed_order_rounds_odd_and_sizes_block_in_sectors() {
        let (block, leaf, internal) = derive_geometry::<i64, i64>(&opts(6, false)).unwrap();

        assert_eq!(leaf, 7);
        assert_eq!(internal, 7);
        assert_eq!(block, 512); // 6 + 16*7 + 8 = 126 -> one sector
    }

    #[test]
    fn fixed_order_floors_at_minimum() {
        let (_, leaf, _) = derive_geometry::<i64, i64>(&opts(2, false)).unwrap();
        assert_eq!(leaf, MIN_B_ORDER);
    }
}
