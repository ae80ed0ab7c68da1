//! # Storage Module
//!
//! The foundational storage layer: a fixed-size block file, an append-only
//! stream file for the redo log, a dense free-block bitmap, and a pooled
//! supply of block-sized buffers.
//!
//! ## Architecture Overview
//!
//! The data file is a flat sequence of `block_size` blocks addressed by
//! index. Block 0 holds the tree metadata record; blocks 1..N hold nodes.
//! Two I/O paths are available:
//!
//! - **Positional I/O** (default): seek + read/write of exactly one block.
//! - **Segmented mmap** (optional, 64-bit hosts): the file is partitioned
//!   into fixed segments that are mapped lazily; a block access slices its
//!   segment. `sync` forces every mapped segment in ascending order.
//!
//! The redo log is a different shape of file entirely: a stream of framed,
//! variable-length records with buffer-boundary alignment, covered by
//! [`stream_store`].
//!
//! ## Buffer Discipline
//!
//! Block reads and writes go through [`BufferPool`] buffers that return to
//! a process-wide pool on drop, so steady-state operation performs no
//! allocation per block I/O.
//!
//! ## Thread Safety
//!
//! `BlockStore` and `StreamStore` are not thread-safe; the tree serializes
//! all access under its exclusive lock. The buffer pool is globally
//! thread-safe.

mod bitmap;
mod block_store;
mod buffer_pool;
mod stream_store;

pub use bitmap::FreeBitmap;
pub use block_store::BlockStore;
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use stream_store::StreamStore;

use std::sync::Arc;

/// Callback invoked with the store's committed size after every successful
/// fsync of a block store or stream store.
pub type SyncCallback = Arc<dyn Fn(u64) + Send + Sync>;
