//! # Internal Node
//!
//! Internal nodes route descents: `allocated` keys separate `allocated+1`
//! child identifiers. For every slot `i`, keys in `children[i]` are
//! strictly less than `keys[i]` and keys in `children[i+1]` are greater
//! than or equal to it.
//!
//! Unlike leaves, internal nodes move their separator key up on a split
//! and pull one down through the parent on merge and redistribution.

use crate::codec::FixedCodec;

use super::node::NULL_ID;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InternalNode<K> {
    pub id: i32,
    pub keys: Vec<K>,
    pub children: Vec<i32>,
    pub deleted: bool,
}

impl<K> InternalNode<K> {
    pub fn new(id: i32) -> InternalNode<K> {
        InternalNode {
            id,
            keys: Vec::new(),
            children: Vec::new(),
            deleted: false,
        }
    }

    pub fn allocated(&self) -> usize {
        self.keys.len()
    }

    pub fn is_under_flow(&self, order: usize) -> bool {
        self.keys.len() < order / 2
    }

    /// The merged node also absorbs the parent separator, hence the `+ 1`.
    pub fn can_merge(&self, other: &InternalNode<K>, order: usize) -> bool {
        self.keys.len() + other.keys.len() + 1 <= order
    }

    /// Insert a separator and the child to its right; `slot` is the child
    /// index the descent took.
    pub fn insert(&mut self, slot: usize, key: K, child_id: i32) {
        self.keys.insert(slot, key);
        self.children.insert(slot + 1, child_id);
    }

    /// Remove the separator at `slot` together with its right child link.
    pub fn remove(&mut self, slot: usize) -> K {
        self.children.remove(slot + 1);
        self.keys.remove(slot)
    }

    /// Move the upper half of keys and children into a fresh node. The
    /// result transiently holds one child per key; the follow-up
    /// [`split_shift_keys_left`](Self::split_shift_keys_left) restores the
    /// keys+1 children shape by surrendering the first key to the parent.
    pub fn split(&mut self) -> InternalNode<K> {
        let j = self.keys.len() / 2;
        let mut high = InternalNode::new(NULL_ID);
        high.keys = self.keys.split_off(j);
        high.children = self.children.split_off(j + 1);
        high
    }

    /// Detach and return the first key, realigning children.
    pub fn split_shift_keys_left(&mut self) -> K {
        self.keys.remove(0)
    }

    /// Absorb the right sibling with the parent separator between the two
    /// key runs; `from` ends empty.
    pub fn merge_from(&mut self, separator: K, from: &mut InternalNode<K>) {
        self.keys.push(separator);
        self.keys.append(&mut from.keys);
        self.children.append(&mut from.children);
    }
}

impl<K: Ord> InternalNode<K> {
    /// Child index the descent for `key` must follow.
    pub fn find_child_slot(&self, key: &K) -> usize {
        match self.keys.binary_search(key) {
            Ok(slot) => slot + 1,
            Err(slot) => slot,
        }
    }
}

impl<K> InternalNode<K> {
    /// Redistribute with the left sibling: `self` (under-full, right of
    /// the pair) receives the tail of `from`, rotating one key through
    /// the parent separator.
    pub fn shift_from_left(&mut self, parent_key: &mut K, from: &mut InternalNode<K>) {
        let shift = (self.keys.len() + from.keys.len()) / 2 - self.keys.len();
        let mut moved_keys = from.keys.split_off(from.keys.len() - shift + 1);
        let new_separator = from.keys.pop().unwrap();
        let old_separator = std::mem::replace(parent_key, new_separator);
        moved_keys.push(old_separator);
        moved_keys.append(&mut self.keys);
        self.keys = moved_keys;

        let mut moved_children = from.children.split_off(from.children.len() - shift);
        moved_children.append(&mut self.children);
        self.children = moved_children;
    }

    /// Redistribute with the right sibling: `self` (under-full, left of
    /// the pair) receives the head of `from`, rotating one key through
    /// the parent separator.
    pub fn shift_from_right(&mut self, parent_key: &mut K, from: &mut InternalNode<K>) {
        let shift = (self.keys.len() + from.keys.len()) / 2 - self.keys.len();
        let mut moved_keys: Vec<K> = from.keys.drain(..shift).collect();
        let new_separator = moved_keys.pop().unwrap();
        let old_separator = std::mem::replace(parent_key, new_separator);
        self.keys.push(old_separator);
        self.keys.append(&mut moved_keys);
        self.children.extend(from.children.drain(..shift));
    }
}

impl<K: FixedCodec> InternalNode<K> {
    /// Serialized size of an internal node of order `b`.
    pub fn struct_estimate_size(b: usize) -> usize {
        4 + 2 + b * K::BYTE_LEN + (b + 1) * 4
    }
}

impl<K: std::fmt::Debug> InternalNode<K> {
    /// Human-readable form used by the storage dump.
    pub fn describe(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = write!(out, "[I{}]({}){{", self.id, self.keys.len());
        for (i, key) in self.keys.iter().enumerate() {
            if i == 0 {
                let _ = write!(out, "c{}", self.children[0]);
            }
            let _ = write!(out, "<{:?}>c{}", key, self.children[i + 1]);
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internal(keys: &[i64], children: &[i32]) -> InternalNode<i64> {
        let mut node = InternalNode::new(-1);
        node.keys.extend_from_slice(keys);
        node.children.extend_from_slice(children);
        node
    }

    #[test]
    fn find_child_slot_routes_by_separator() {
        let node = internal(&[10, 20], &[1, 2, 3]);

        assert_eq!(node.find_child_slot(&5), 0);
        assert_eq!(node.find_child_slot(&10), 1); // equal goes right
        assert_eq!(node.find_child_slot(&15), 1);
        assert_eq!(node.find_child_slot(&20), 2);
        assert_eq!(node.find_child_slot(&99), 2);
    }

    #[test]
    fn insert_places_child_right_of_key() {
        let mut node = internal(&[10, 30], &[1, 2, 3]);
        node.insert(1, 20, 9);

        assert_eq!(node.keys, vec![10, 20, 30]);
        assert_eq!(node.children, vec![1, 2, 9, 3]);
    }

    #[test]
    fn remove_drops_key_and_right_child() {
        let mut node = internal(&[10, 20, 30], &[1, 2, 3, 4]);
        let removed = node.remove(1);

        assert_eq!(removed, 20);
        assert_eq!(node.keys, vec![10, 30]);
        assert_eq!(node.children, vec![1, 2, 4]);
    }

    #[test]
    fn split_then_shift_restores_child_alignment() {
        let mut node = internal(&[10, 20, 30, 40, 50], &[1, 2, 3, 4, 5, 6]);
        let mut high = node.split();

        assert_eq!(node.keys, vec![10, 20]);
        assert_eq!(node.children, vec![1, 2, 3]);
        assert_eq!(high.keys, vec![30, 40, 50]);
        assert_eq!(high.children, vec![4, 5, 6]);

        let promoted = high.split_shift_keys_left();
        assert_eq!(promoted, 30);
        assert_eq!(high.keys, vec![40, 50]);
        assert_eq!(high.children, vec![4, 5, 6]);
    }

    #[test]
    fn merge_pulls_the_separator_down() {
        let mut left = internal(&[10], &[1, 2]);
        let mut right = internal(&[30], &[3, 4]);
        left.merge_from(20, &mut right);

        assert_eq!(left.keys, vec![10, 20, 30]);
        assert_eq!(left.children, vec![1, 2, 3, 4]);
    }

    #[test]
    fn can_merge_accounts_for_the_separator() {
        let a = internal(&[10], &[1, 2]);
        let b = internal(&[30, 40, 50], &[3, 4, 5, 6]);

        assert!(a.can_merge(&b, 5));
        let c = internal(&[30, 40, 50, 60], &[3, 4, 5, 6, 7]);
        assert!(!a.can_merge(&c, 5));
    }

    #[test]
    fn shift_from_right_rotates_through_parent() {
        let mut node = internal(&[10], &[1, 2]);
        let mut from = internal(&[30, 40, 50, 60, 70], &[3, 4, 5, 6, 7, 8]);
        let mut sep = 20;

        node.shift_from_right(&mut sep, &mut from);

        // shift = 3 - 1 = 2: node gains the old separator and 30.
        assert_eq!(node.keys, vec![10, 20, 30]);
        assert_eq!(node.children, vec![1, 2, 3, 4]);
        assert_eq!(sep, 40);
        assert_eq!(from.keys, vec![50, 60, 70]);
        assert_eq!(from.children, vec![5, 6, 7, 8]);
    }

    #[test]
    fn shift_from_left_rotates_through_parent() {
        let mut from = internal(&[30, 40, 50, 60, 70], &[3, 4, 5, 6, 7, 8]);
        let mut node = internal(&[90], &[9, 10]);
        let mut sep = 80;

        node.shift_from_left(&mut sep, &mut from);

        // shift = 3 - 1 = 2: node gains 70 and the old separator.
        assert_eq!(from.keys, vec![30, 40, 50]);
        assert_eq!(from.children, vec![3, 4, 5, 6]);
        assert_eq!(sep, 60);
        assert_eq!(node.keys, vec![70, 80, 90]);
        assert_eq!(node.children, vec![7, 8, 9, 10]);
    }
}
