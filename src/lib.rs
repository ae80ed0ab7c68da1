//! # blocktree - Embedded Ordered Key-Value Store
//!
//! blocktree is an embedded, single-process, ordered key-value store built
//! around a persistent B+Tree whose nodes are serialized into fixed-size
//! blocks of a single data file. Keys and values are fixed-width,
//! byte-comparable records.
//!
//! ## Quick Start
//!
//! ```ignore
//! use blocktree::{BlockTree, TreeBuilder};
//!
//! let tree: BlockTree<i64, i64> = TreeBuilder::new("/tmp/example")
//!     .b_size(512)
//!     .cache_bytes(4 * 1024 * 1024)
//!     .build()?;
//!
//! tree.create()?;
//! tree.put(&42, &1)?;
//! assert_eq!(tree.get(&42)?, Some(1));
//! tree.close()?;
//! ```
//!
//! ## Architecture
//!
//! The crate is layered bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │    Public API (BlockTree<K, V>)     │
//! ├─────────────────────────────────────┤
//! │  Tree Engine (split/merge cascades) │
//! ├──────────────────┬──────────────────┤
//! │   Node Cache     │    Redo Log      │
//! ├──────────────────┴──────────────────┤
//! │  Block Store │ Free Bitmap │ Pool   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! A tree named `/path/base` owns three files:
//!
//! ```text
//! base.data    fixed-size blocks; block 0 is the metadata record
//! base.redo    append-only redo log of PUT/REMOVE records
//! base.free    free-block bitmap, present only after a clean shutdown
//! ```
//!
//! ## Durability Model
//!
//! Every mutation appends a redo record before its dirty pages reach disk.
//! `sync` flushes dirty pages in ascending block order, rewrites the
//! metadata record, forces the file, and truncates the redo log. A crash
//! between syncs is repaired by [`BlockTree::recovery`], which rebuilds the
//! tree from surviving blocks and replays the redo log.
//!
//! ## Concurrency
//!
//! Every public operation is serialized under one exclusive lock. The
//! iterator re-locks per step and tolerates interleaved mutation at the
//! price of snapshot semantics; see [`BlockTree::iter`].
//!
//! ## Module Overview
//!
//! - [`codec`]: fixed-width, order-preserving record encoding
//! - [`storage`]: block file, redo stream file, free bitmap, buffer pool
//! - [`btree`]: nodes, node cache, tree engine, persistence controller
//! - [`config`]: shared constants and their invariants

pub mod btree;
pub mod codec;
pub mod config;
pub mod error;
pub mod storage;

pub use btree::{BlockTree, TreeBuilder, TreeEntry, TreeIter, TreeStats};
pub use codec::FixedCodec;
pub use error::StoreError;
pub use storage::SyncCallback;
