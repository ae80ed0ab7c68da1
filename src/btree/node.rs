//! # Node Core
//!
//! The tagged node variant shared by the tree engine, plus one-block
//! serialization.
//!
//! ## Block Layout
//!
//! Every node serializes into exactly one block (big-endian):
//!
//! ```text
//! common    i32 id | u16 allocated | K * allocated
//! leaf      ... | V * allocated | i32 left_id | i32 right_id
//! internal  ... | i32 * (allocated + 1)            (children)
//! ```
//!
//! A block whose first four bytes decode to id 0 is a free or never-written
//! block; deserialization reports it as [`StoreError::InvalidNode`] so
//! scans can mark the block free and move on.

use eyre::{Result, WrapErr};

use super::internal::InternalNode;
use super::leaf::LeafNode;
use crate::codec::FixedCodec;
use crate::error::StoreError;

/// Null node identifier.
pub(crate) const NULL_ID: i32 = 0;

/// Positive ids are leaves, negative ids internal nodes.
pub(crate) fn is_leaf_id(id: i32) -> bool {
    id > 0
}

/// Block index a node id maps to.
pub(crate) fn block_index(id: i32) -> u32 {
    id.unsigned_abs()
}

/// A B+Tree node: one block's worth of keys plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K>),
}

impl<K, V> Node<K, V> {
    pub fn id(&self) -> i32 {
        match self {
            Node::Leaf(n) => n.id,
            Node::Internal(n) => n.id,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn allocated(&self) -> usize {
        match self {
            Node::Leaf(n) => n.allocated(),
            Node::Internal(n) => n.allocated(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allocated() == 0
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Node::Leaf(n) => n.deleted,
            Node::Internal(n) => n.deleted,
        }
    }

    pub fn mark_deleted(&mut self) {
        match self {
            Node::Leaf(n) => n.deleted = true,
            Node::Internal(n) => n.deleted = true,
        }
    }

    /// Key handed to the parent after a split. Leaves keep the separator
    /// (a copy of their first key); internal nodes surrender it.
    pub fn split_shift_keys_left(&mut self) -> K
    where
        K: Clone,
    {
        match self {
            Node::Leaf(n) => n.separator(),
            Node::Internal(n) => n.split_shift_keys_left(),
        }
    }
}

impl<K: FixedCodec + Clone, V: FixedCodec + Clone> Node<K, V> {
    /// Serialize into the front of `buf`; the remainder stays zeroed.
    pub fn serialize(&self, buf: &mut [u8]) {
        let mut at = 0;
        write_i32(buf, &mut at, self.id());
        write_u16(buf, &mut at, self.allocated() as u16);
        match self {
            Node::Leaf(n) => {
                for key in &n.keys {
                    key.encode(&mut buf[at..at + K::BYTE_LEN]);
                    at += K::BYTE_LEN;
                }
                for value in &n.values {
                    value.encode(&mut buf[at..at + V::BYTE_LEN]);
                    at += V::BYTE_LEN;
                }
                write_i32(buf, &mut at, n.left_id);
                write_i32(buf, &mut at, n.right_id);
            }
            Node::Internal(n) => {
                for key in &n.keys {
                    key.encode(&mut buf[at..at + K::BYTE_LEN]);
                    at += K::BYTE_LEN;
                }
                for child in &n.children {
                    write_i32(buf, &mut at, *child);
                }
            }
        }
    }

    /// Decode one block back into a node. A zero id marks a free block.
    pub fn deserialize(buf: &[u8]) -> Result<Node<K, V>> {
        let mut at = 0;
        let id = read_i32(buf, &mut at)?;
        if id == NULL_ID {
            return Err(eyre::Report::new(StoreError::InvalidNode))
                .wrap_err("block holds a null node id");
        }
        let allocated = read_u16(buf, &mut at)? as usize;

        if is_leaf_id(id) {
            let need = allocated * (K::BYTE_LEN + V::BYTE_LEN) + 8;
            ensure_remaining(buf, at, need)?;
            let mut node = LeafNode::new(id);
            for _ in 0..allocated {
                node.keys.push(K::decode(&buf[at..at + K::BYTE_LEN]));
                at += K::BYTE_LEN;
            }
            for _ in 0..allocated {
                node.values.push(V::decode(&buf[at..at + V::BYTE_LEN]));
                at += V::BYTE_LEN;
            }
            node.left_id = read_i32(buf, &mut at)?;
            node.right_id = read_i32(buf, &mut at)?;
            Ok(Node::Leaf(node))
        } else {
            let need = allocated * K::BYTE_LEN + (allocated + 1) * 4;
            ensure_remaining(buf, at, need)?;
            let mut node = InternalNode::new(id);
            for _ in 0..allocated {
                node.keys.push(K::decode(&buf[at..at + K::BYTE_LEN]));
                at += K::BYTE_LEN;
            }
            for _ in 0..allocated + 1 {
                node.children.push(read_i32(buf, &mut at)?);
            }
            Ok(Node::Internal(node))
        }
    }
}

fn ensure_remaining(buf: &[u8], at: usize, need: usize) -> Result<()> {
    if buf.len() < at + need {
        return Err(eyre::Report::new(StoreError::InvalidNode)).wrap_err_with(|| {
            format!(
                "node payload of {} bytes exceeds the {}-byte block",
                at + need,
                buf.len()
            )
        });
    }
    Ok(())
}

fn write_i32(buf: &mut [u8], at: &mut usize, v: i32) {
    buf[*at..*at + 4].copy_from_slice(&v.to_be_bytes());
    *at += 4;
}

fn write_u16(buf: &mut [u8], at: &mut usize, v: u16) {
    buf[*at..*at + 2].copy_from_slice(&v.to_be_bytes());
    *at += 2;
}

fn read_i32(buf: &[u8], at: &mut usize) -> Result<i32> {
    if buf.len() < *at + 4 {
        return Err(eyre::Report::new(StoreError::InvalidNode));
    }
    let v = i32::from_be_bytes(buf[*at..*at + 4].try_into().unwrap());
    *at += 4;
    Ok(v)
}

fn read_u16(buf: &[u8], at: &mut usize) -> Result<u16> {
    if buf.len() < *at + 2 {
        return Err(eyre::Report::new(StoreError::InvalidNode));
    }
    let v = u16::from_be_bytes(buf[*at..*at + 2].try_into().unwrap());
    *at += 2;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_sign_encodes_kind() {
        assert!(is_leaf_id(1));
        assert!(is_leaf_id(i32::MAX));
        assert!(!is_leaf_id(-1));
        assert!(!is_leaf_id(NULL_ID));
        assert_eq!(block_index(-7), 7);
        assert_eq!(block_index(7), 7);
    }

    #[test]
    fn leaf_round_trip_is_structurally_equal() {
        let mut leaf: LeafNode<i64, i64> = LeafNode::new(3);
        leaf.keys.extend([10, 20, 30]);
        leaf.values.extend([100, 200, 300]);
        leaf.left_id = 2;
        leaf.right_id = 4;

        let mut block = vec![0u8; 512];
        Node::Leaf(leaf.clone()).serialize(&mut block);
        let back: Node<i64, i64> = Node::deserialize(&block).unwrap();

        assert_eq!(back, Node::Leaf(leaf));
    }

    #[test]
    fn internal_round_trip_is_structurally_equal() {
        let mut node: InternalNode<i64> = InternalNode::new(-5);
        node.keys.extend([10, 20]);
        node.children.extend([1, 2, 3]);

        let mut block = vec![0u8; 512];
        Node::<i64, i64>::Internal(node.clone()).serialize(&mut block);
        let back: Node<i64, i64> = Node::deserialize(&block).unwrap();

        assert_eq!(back, Node::Internal(node));
    }

    #[test]
    fn zeroed_block_is_an_invalid_node() {
        let block = vec![0u8; 512];
        let err = Node::<i64, i64>::deserialize(&block).unwrap_err();
        assert_eq!(
            crate::error::StoreError::classify(&err),
            Some(crate::error::StoreError::InvalidNode)
        );
    }

    #[test]
    fn oversized_allocation_count_is_an_invalid_node() {
        let mut block = vec![0u8; 64];
        block[..4].copy_from_slice(&1i32.to_be_bytes());
        block[4..6].copy_from_slice(&u16::MAX.to_be_bytes());

        let err = Node::<i64, i64>::deserialize(&block).unwrap_err();
        assert_eq!(
            crate::error::StoreError::classify(&err),
            Some(crate::error::StoreError::InvalidNode)
        );
    }
}
