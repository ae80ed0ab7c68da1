//! # Metadata Record
//!
//! Block 0 of the data file holds one fixed record describing the tree,
//! framed by two magic words. All fields are network byte order; zerocopy
//! big-endian types keep the on-disk layout and the struct definition the
//! same thing.
//!
//! ## Layout (53 bytes)
//!
//! ```text
//! u32 MAGIC1 | u32 block_size | u32 b_order_leaf | u32 b_order_internal |
//! u32 storage_block | i32 root_id | i32 low_id | i32 high_id |
//! u32 elements | u32 height | u32 max_internal_nodes | u32 max_leaf_nodes |
//! u8 clean_flag | u32 MAGIC2
//! ```
//!
//! The clean flag is `0xEA` only when the last shutdown flushed every
//! pending write; any other value reads as unclean and forces recovery.

use eyre::{Result, WrapErr};
use zerocopy::big_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{METADATA_CLEAN, METADATA_MAGIC_1, METADATA_MAGIC_2};
use crate::error::StoreError;

pub(crate) const METADATA_SIZE: usize = 53;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct Metadata {
    magic1: U32,
    pub block_size: U32,
    pub b_order_leaf: U32,
    pub b_order_internal: U32,
    pub storage_block: U32,
    pub root_id: I32,
    pub low_id: I32,
    pub high_id: I32,
    pub elements: U32,
    pub height: U32,
    pub max_internal_nodes: U32,
    pub max_leaf_nodes: U32,
    clean_flag: u8,
    magic2: U32,
}

const _: () = assert!(std::mem::size_of::<Metadata>() == METADATA_SIZE);

impl Metadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block_size: u32,
        b_order_leaf: u32,
        b_order_internal: u32,
        storage_block: u32,
        root_id: i32,
        low_id: i32,
        high_id: i32,
        elements: u32,
        height: u32,
        max_internal_nodes: u32,
        max_leaf_nodes: u32,
        clean: bool,
    ) -> Metadata {
        Metadata {
            magic1: U32::new(METADATA_MAGIC_1),
            block_size: U32::new(block_size),
            b_order_leaf: U32::new(b_order_leaf),
            b_order_internal: U32::new(b_order_internal),
            storage_block: U32::new(storage_block),
            root_id: I32::new(root_id),
            low_id: I32::new(low_id),
            high_id: I32::new(high_id),
            elements: U32::new(elements),
            height: U32::new(height),
            max_internal_nodes: U32::new(max_internal_nodes),
            max_leaf_nodes: U32::new(max_leaf_nodes),
            clean_flag: if clean { METADATA_CLEAN } else { 0x00 },
            magic2: U32::new(METADATA_MAGIC_2),
        }
    }

    /// Parse and magic-check the record at the front of block 0.
    pub fn from_bytes(bytes: &[u8]) -> Result<Metadata> {
        if bytes.len() < METADATA_SIZE {
            return Err(eyre::Report::new(StoreError::InvalidData)).wrap_err_with(|| {
                format!("metadata buffer too small: {} < {}", bytes.len(), METADATA_SIZE)
            });
        }
        let meta = Metadata::read_from_bytes(&bytes[..METADATA_SIZE])
            .map_err(|_| eyre::Report::new(StoreError::InvalidData))?;
        if meta.magic1.get() != METADATA_MAGIC_1 {
            return Err(eyre::Report::new(StoreError::InvalidData))
                .wrap_err("invalid metadata (MAGIC1)");
        }
        if meta.magic2.get() != METADATA_MAGIC_2 {
            return Err(eyre::Report::new(StoreError::InvalidData))
                .wrap_err("invalid metadata (MAGIC2)");
        }
        Ok(meta)
    }

    pub fn is_clean(&self) -> bool {
        self.clean_flag == METADATA_CLEAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(clean: bool) -> Metadata {
        Metadata::new(512, 31, 63, 9, 1, 1, 5, 100, 2, 3, 6, clean)
    }

    #[test]
    fn metadata_is_53_bytes() {
        assert_eq!(std::mem::size_of::<Metadata>(), 53);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let meta = sample(true);
        let bytes = meta.as_bytes().to_vec();
        let back = Metadata::from_bytes(&bytes).unwrap();

        assert_eq!(back.block_size.get(), 512);
        assert_eq!(back.b_order_leaf.get(), 31);
        assert_eq!(back.b_order_internal.get(), 63);
        assert_eq!(back.storage_block.get(), 9);
        assert_eq!(back.root_id.get(), 1);
        assert_eq!(back.high_id.get(), 5);
        assert_eq!(back.elements.get(), 100);
        assert!(back.is_clean());
    }

    #[test]
    fn unclean_flag_reads_back_unclean() {
        let bytes = sample(false).as_bytes().to_vec();
        assert!(!Metadata::from_bytes(&bytes).unwrap().is_clean());
    }

    #[test]
    fn magic_layout_is_big_endian() {
        let bytes = sample(true).as_bytes().to_vec();
        assert_eq!(&bytes[..4], &[0x42, 0xD6, 0xAE, 0xCB]);
        assert_eq!(&bytes[METADATA_SIZE - 4..], &[0x6B, 0x70, 0x8B, 0x42]);
        assert_eq!(bytes[METADATA_SIZE - 5], 0xEA);
    }

    #[test]
    fn corrupt_magic_classifies_as_invalid_data() {
        let mut bytes = sample(true).as_bytes().to_vec();
        bytes[0] = 0xFF;

        let err = Metadata::from_bytes(&bytes).unwrap_err();
        assert_eq!(StoreError::classify(&err), Some(StoreError::InvalidData));
    }

    #[test]
    fn zeroed_block_classifies_as_invalid_data() {
        let bytes = vec![0u8; 512];
        let err = Metadata::from_bytes(&bytes).unwrap_err();
        assert_eq!(StoreError::classify(&err), Some(StoreError::InvalidData));
    }
}
