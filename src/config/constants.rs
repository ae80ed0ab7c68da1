//! # Configuration Constants
//!
//! This module centralizes the crate's wire-format and sizing constants.
//! Values that must agree with each other are co-located and, where the
//! relationship is expressible, pinned with compile-time assertions.
//!
//! ## Relationships
//!
//! ```text
//! MIN_B_ORDER (5)
//!       └─> node orders are odd and >= MIN_B_ORDER; auto-tune searches
//!           upward from here for the largest odd order fitting a block
//!
//! DEFAULT_BLOCK_SIZE (512)
//!       └─> non-auto-tuned trees round the serialized node size up to a
//!           multiple of this
//!
//! STREAM_HEADER_LEN (6) + payload + STREAM_FOOTER_LEN (1)
//!       └─> full framing cost of one redo record
//!
//! READ_CACHE_*_PCT
//!       └─> split of maxCacheNodes between the leaf and internal read
//!           pools; both floors at READ_CACHE_MIN_NODES
//! ```

/// Minimal b-order allowed for leaf and internal nodes.
pub const MIN_B_ORDER: usize = 5;

/// Default block size in bytes; also the rounding unit for non-auto-tuned
/// trees (one HDD sector).
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default soft cap on cached node bytes.
pub const DEFAULT_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Smallest accepted cache size.
pub const MIN_CACHE_BYTES: usize = 1024;

/// Fraction (percent) of `maxCacheNodes` granted to the internal-node read
/// pool; the rest goes to the leaf pool.
pub const READ_CACHE_INTERNAL_PCT: usize = 5;

/// Fraction (percent) of `maxCacheNodes` granted to the leaf-node read pool.
pub const READ_CACHE_LEAF_PCT: usize = 95;

/// Floor for either read pool regardless of the percentage split.
pub const READ_CACHE_MIN_NODES: usize = 37;

/// Dirty pool flush trigger: flush when dirty nodes exceed
/// `maxCacheNodes / DIRTY_FLUSH_DIVISOR` during a release pass.
pub const DIRTY_FLUSH_DIVISOR: usize = 10;

const _: () = assert!(READ_CACHE_INTERNAL_PCT + READ_CACHE_LEAF_PCT == 100);

// ============================================================================
// METADATA RECORD (block 0)
// ============================================================================

/// Magic framing the start of the metadata record.
pub const METADATA_MAGIC_1: u32 = 0x42D6_AECB;

/// Magic framing the end of the metadata record.
pub const METADATA_MAGIC_2: u32 = 0x6B70_8B42;

/// Clean-shutdown flag value; anything else reads as unclean.
pub const METADATA_CLEAN: u8 = 0xEA;

// ============================================================================
// REDO STREAM FORMAT
// ============================================================================

/// Record header magic (two bytes, msb first on disk).
pub const STREAM_MAGIC: u16 = 0x754C;

/// First byte of an alignment padding run.
pub const STREAM_PADDING_MAGIC: u8 = 0x42;

/// Record footer magic.
pub const STREAM_FOOTER_MAGIC: u8 = 0x24;

/// Header bytes per record: u16 magic + u32 payload length.
pub const STREAM_HEADER_LEN: usize = 6;

/// Footer bytes per record.
pub const STREAM_FOOTER_LEN: usize = 1;

/// Smallest stream buffer; buffers round up to the next power of two from
/// here.
pub const MIN_STREAM_BUFFER: usize = 512;

/// Redo payload opcodes.
pub const REDO_OP_PUT: u8 = 0x0A;
pub const REDO_OP_REMOVE: u8 = 0x0B;

// ============================================================================
// BLOCK STORE / MMAP
// ============================================================================

/// Target byte size of one mapped segment (32 OS pages). The effective
/// segment is the largest multiple of the block size not exceeding this,
/// and at least one block.
pub const MMAP_SEGMENT_BYTES: usize = 32 * 4096;

// ============================================================================
// TREE MAINTENANCE
// ============================================================================

/// Removing the last element of a store larger than this many blocks resets
/// the tree outright to reclaim space quickly.
pub const TREE_RESET_MIN_BLOCKS: u32 = 4096;

/// Upper bound accepted for a free-bitmap sidecar file.
pub const FREE_BITMAP_MAX_FILE: u64 = 16 * 1024 * 1024;

/// File name suffixes for the three store files.
pub const DATA_EXT: &str = ".data";
pub const REDO_EXT: &str = ".redo";
pub const FREE_EXT: &str = ".free";

/// Suffix inserted when recovery archives a broken file.
pub const BROKEN_SUFFIX: &str = ".broken";

/// Suffix of the scratch tree recovery builds next to the broken one.
pub const RECOVER_SUFFIX: &str = ".recover";
