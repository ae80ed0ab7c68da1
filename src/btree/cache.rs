//! # Node Cache
//!
//! Dual-layer cache between the tree engine and the block store, split by
//! node kind:
//!
//! - **Read pools** (`read_leaf`, `read_internal`): LRU-ordered clean
//!   nodes. Sized from the byte budget: `maxCacheNodes = bytes / block`,
//!   of which the internal pool gets `max(5%, 37)` and the leaf pool
//!   `max(95%, 37)`. Internal nodes are few and hot, so a thin slice of
//!   the budget keeps the whole upper tree resident.
//! - **Dirty pools** (`dirty_leaf`, `dirty_internal`): nodes mutated since
//!   the last flush. Never evicted; drained in ascending block order by
//!   the persistence controller.
//!
//! Lookup order is dirty pool, then read pool, then disk (the caller's
//! fallback). Marking a node dirty removes it from its read pool so a
//! stale clean copy can never shadow the dirty one.
//!
//! The pools own the canonical in-memory copy of every node; the engine
//! works on transient clones and writes them back through `set_dirty`.

use hashbrown::HashMap;
use lru::LruCache;

use super::node::{block_index, is_leaf_id, Node};
use crate::config::{
    READ_CACHE_INTERNAL_PCT, READ_CACHE_LEAF_PCT, READ_CACHE_MIN_NODES,
};

pub(crate) struct NodeCache<K, V> {
    read_leaf: LruCache<i32, Node<K, V>>,
    read_internal: LruCache<i32, Node<K, V>>,
    dirty_leaf: HashMap<i32, Node<K, V>>,
    dirty_internal: HashMap<i32, Node<K, V>>,
    max_nodes: usize,
    cap_leaf: usize,
    cap_internal: usize,
}

impl<K: Clone, V: Clone> NodeCache<K, V> {
    pub fn new(cache_bytes: usize, block_size: usize) -> NodeCache<K, V> {
        let max_nodes = cache_bytes / block_size;
        let cap_internal =
            (max_nodes * READ_CACHE_INTERNAL_PCT / 100).max(READ_CACHE_MIN_NODES);
        let cap_leaf = (max_nodes * READ_CACHE_LEAF_PCT / 100).max(READ_CACHE_MIN_NODES);
        NodeCache {
            read_leaf: LruCache::unbounded(),
            read_internal: LruCache::unbounded(),
            dirty_leaf: HashMap::new(),
            dirty_internal: HashMap::new(),
            max_nodes,
            cap_leaf,
            cap_internal,
        }
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn cap_leaf(&self) -> usize {
        self.cap_leaf
    }

    pub fn cap_internal(&self) -> usize {
        self.cap_internal
    }

    pub fn read_len(&self) -> usize {
        self.read_leaf.len() + self.read_internal.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty_leaf.len() + self.dirty_internal.len()
    }

    pub fn read_leaf_len(&self) -> usize {
        self.read_leaf.len()
    }

    pub fn read_internal_len(&self) -> usize {
        self.read_internal.len()
    }

    /// Dirty pool first, read pool second; a read-pool hit refreshes
    /// recency. Returns a clone the engine may mutate freely.
    pub fn lookup(&mut self, id: i32) -> Option<Node<K, V>> {
        if is_leaf_id(id) {
            if let Some(node) = self.dirty_leaf.get(&id) {
                return Some(node.clone());
            }
            self.read_leaf.get(&id).cloned()
        } else {
            if let Some(node) = self.dirty_internal.get(&id) {
                return Some(node.clone());
            }
            self.read_internal.get(&id).cloned()
        }
    }

    /// Insert a clean node loaded from disk.
    pub fn insert_read(&mut self, node: Node<K, V>) {
        let id = node.id();
        if is_leaf_id(id) {
            self.read_leaf.put(id, node);
        } else {
            self.read_internal.put(id, node);
        }
    }

    /// Record a mutated node, shadowing any clean copy.
    pub fn set_dirty(&mut self, node: Node<K, V>) {
        let id = node.id();
        if is_leaf_id(id) {
            self.read_leaf.pop(&id);
            self.dirty_leaf.insert(id, node);
        } else {
            self.read_internal.pop(&id);
            self.dirty_internal.insert(id, node);
        }
    }

    /// Drain one dirty pool in ascending block order, ready for flushing.
    pub fn drain_dirty(&mut self, leaves: bool) -> Vec<Node<K, V>> {
        let pool = if leaves {
            &mut self.dirty_leaf
        } else {
            &mut self.dirty_internal
        };
        let mut nodes: Vec<Node<K, V>> = pool.drain().map(|(_, node)| node).collect();
        nodes.sort_by_key(|node| block_index(node.id()));
        nodes
    }

    /// Evict least-recently-used entries until both read pools are within
    /// their caps. Returns (leaf, internal) eviction counts.
    pub fn evict_excess(&mut self) -> (usize, usize) {
        let mut evicted_leaf = 0;
        while self.read_leaf.len() > self.cap_leaf {
            self.read_leaf.pop_lru();
            evicted_leaf += 1;
        }
        let mut evicted_internal = 0;
        while self.read_internal.len() > self.cap_internal {
            self.read_internal.pop_lru();
            evicted_internal += 1;
        }
        (evicted_leaf, evicted_internal)
    }

    pub fn clear_read(&mut self) {
        self.read_leaf.clear();
        self.read_internal.clear();
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_leaf.clear();
        self.dirty_internal.clear();
    }

    pub fn clear_all(&mut self) {
        self.clear_read();
        self.clear_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::leaf::LeafNode;

    fn leaf_node(id: i32, key: i64) -> Node<i64, i64> {
        let mut leaf = LeafNode::new(id);
        leaf.keys.push(key);
        leaf.values.push(key * 10);
        Node::Leaf(leaf)
    }

    #[test]
    fn pool_sizes_derive_from_byte_budget() {
        let cache: NodeCache<i64, i64> = NodeCache::new(1024 * 1024, 1024);
        assert_eq!(cache.max_nodes(), 1024);
        assert_eq!(cache.cap_internal(), 51);
        assert_eq!(cache.cap_leaf(), 972);
    }

    #[test]
    fn tiny_budget_floors_at_minimum_nodes() {
        let cache: NodeCache<i64, i64> = NodeCache::new(1024, 512);
        assert_eq!(cache.cap_internal(), READ_CACHE_MIN_NODES);
        assert_eq!(cache.cap_leaf(), READ_CACHE_MIN_NODES);
    }

    #[test]
    fn dirty_pool_shadows_read_pool() {
        let mut cache: NodeCache<i64, i64> = NodeCache::new(1024 * 1024, 1024);
        cache.insert_read(leaf_node(1, 10));

        let mut dirty = leaf_node(1, 10);
        if let Node::Leaf(l) = &mut dirty {
            l.values[0] = 999;
        }
        cache.set_dirty(dirty);

        let seen = cache.lookup(1).unwrap();
        match seen {
            Node::Leaf(l) => assert_eq!(l.values[0], 999),
            _ => panic!("expected leaf"),
        }
        assert_eq!(cache.read_len(), 0);
        assert_eq!(cache.dirty_len(), 1);
    }

    #[test]
    fn drain_dirty_sorts_by_block_index() {
        let mut cache: NodeCache<i64, i64> = NodeCache::new(1024 * 1024, 1024);
        for id in [9, 2, 77, 30] {
            cache.set_dirty(leaf_node(id, id as i64));
        }

        let drained = cache.drain_dirty(true);
        let ids: Vec<i32> = drained.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![2, 9, 30, 77]);
        assert_eq!(cache.dirty_len(), 0);
    }

    #[test]
    fn evict_excess_drops_least_recently_used_first() {
        let mut cache: NodeCache<i64, i64> = NodeCache::new(1024, 512);
        for id in 1..=(READ_CACHE_MIN_NODES as i32 + 3) {
            cache.insert_read(leaf_node(id, id as i64));
        }
        // Touch the oldest so it survives eviction.
        cache.lookup(1);

        let (evicted, _) = cache.evict_excess();
        assert_eq!(evicted, 3);
        assert!(cache.lookup(1).is_some());
        assert!(cache.lookup(2).is_none());
    }
}
