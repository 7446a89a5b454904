//! Least-recently-used cache.
//!
//! Entries are kept in a doubly-linked list threaded through a slab, so that
//! every operation is O(1). Iteration yields the least-recently used entry
//! first. The cache has two soft bounds: once it grows beyond `size_max`
//! entries are dropped from the cold end until `size_min` remain.
//!
//! In automatic mode the cache frees memory by itself on insert. Otherwise
//! the owner calls [`LruCache::make_room`], passing a predicate that tells
//! which entries must survive (the database uses this to keep dirty and
//! pinned handlers).

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hash};

use seahash::SeaHasher;

use crate::error::{FolioError, Result};

pub type OtherHasher = BuildHasherDefault<SeaHasher>;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruCache<K, V> {
    size_min: usize,
    size_max: usize,
    automatic: bool,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize, OtherHasher>,
    first: Option<usize>,
    last: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(size_min: usize, size_max: usize) -> Result<Self> {
        if size_max < size_min {
            return Err(FolioError::Config(format!(
                "the 'size_max' ({size_max}) is smaller than 'size_min' ({size_min})"
            )));
        }
        Ok(Self {
            size_min,
            size_max,
            automatic: true,
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::default(),
            first: None,
            last: None,
        })
    }
    /// Disables automatic eviction on insert.
    pub fn manual(mut self) -> Self {
        self.automatic = false;
        self
    }
    pub fn size_min(&self) -> usize {
        self.size_min
    }
    pub fn size_max(&self) -> usize {
        self.size_max
    }
    pub fn len(&self) -> usize {
        self.index.len()
    }
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    // the index only ever points at occupied slots
    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }
    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|node| (node.prev, node.next)) else {
            return;
        };
        match prev.and_then(|p| self.node_mut(p)) {
            Some(node) => node.next = next,
            None => self.first = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(node) => node.prev = prev,
            None => self.last = prev,
        }
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn link_last(&mut self, idx: usize) {
        let last = self.last;
        if let Some(node) = self.node_mut(idx) {
            node.prev = last;
            node.next = None;
        }
        match last.and_then(|l| self.node_mut(l)) {
            Some(node) => node.next = Some(idx),
            None => self.first = Some(idx),
        }
        self.last = Some(idx);
    }

    /// Returns the value and marks it as the most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.touch_index(idx);
        self.node(idx).map(|node| &node.value)
    }
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.touch_index(idx);
        self.node_mut(idx).map(|node| &mut node.value)
    }
    /// Returns the value without changing the order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.node(idx).map(|node| &node.value)
    }
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.node_mut(idx).map(|node| &mut node.value)
    }

    fn touch_index(&mut self, idx: usize) {
        if self.last == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_last(idx);
    }

    /// Moves the entry to the most-recently used end. Returns false when
    /// the key is not cached.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.index.get(key) {
            Some(&idx) => {
                self.touch_index(idx);
                true
            }
            None => false,
        }
    }

    /// Inserts or replaces a value; either way it becomes the most recently
    /// used. Returns the previous value for the key, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            let old = self.node_mut(idx).map(|node| std::mem::replace(&mut node.value, value));
            self.touch_index(idx);
            return old;
        }
        let node = Node { key: key.clone(), value, prev: None, next: None };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.link_last(idx);
        if self.automatic && self.len() > self.size_max {
            while self.len() > self.size_min {
                self.pop_lru();
            }
        }
        None
    }

    pub fn pop(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let node = self.nodes[idx].take()?;
        self.free.push(idx);
        Some(node.value)
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let idx = self.first?;
        let key = self.node(idx)?.key.clone();
        let value = self.pop(&key)?;
        Some((key, value))
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.first = None;
        self.last = None;
    }

    /// Iterates from the least to the most recently used entry.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter { cache: self, cursor: self.first }
    }
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// Drops entries from the least-recently used end until `size_min`
    /// entries remain, skipping every entry for which `keep` answers true.
    /// Nothing happens while the cache holds fewer than `size_max` entries.
    pub fn make_room<F>(&mut self, mut keep: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let size = self.len();
        if size < self.size_max || size <= self.size_min {
            return Vec::new();
        }
        let mut n = size - self.size_min;
        let mut victims = Vec::new();
        let mut cursor = self.first;
        while let Some(node) = cursor.and_then(|idx| self.node(idx)) {
            cursor = node.next;
            if keep(&node.key, &node.value) {
                continue;
            }
            victims.push(node.key.clone());
            n -= 1;
            if n == 0 {
                break;
            }
        }
        victims
            .into_iter()
            .filter_map(|key| self.pop(&key).map(|value| (key, value)))
            .collect()
    }
}

pub struct Iter<'a, K, V> {
    cache: &'a LruCache<K, V>,
    cursor: Option<usize>,
}

impl<'a, K: Eq + Hash + Clone, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor.and_then(|idx| self.cache.node(idx))?;
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_follows_access() {
        let mut cache = LruCache::new(10, 10).unwrap();
        for i in 0..5 {
            cache.insert(i, i * 10);
        }
        cache.get(&1);
        cache.touch(&0);
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![2, 3, 4, 1, 0]);
        assert_eq!(cache.pop(&3), Some(30));
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![2, 4, 1, 0]);
    }

    #[test]
    fn automatic_eviction_down_to_size_min() {
        let mut cache = LruCache::new(3, 5).unwrap();
        for i in 0..6 {
            cache.insert(i, ());
        }
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![3, 4, 5]);
    }

    #[test]
    fn make_room_skips_kept_entries() {
        let mut cache = LruCache::new(2, 4).unwrap().manual();
        for i in 0..6 {
            cache.insert(i, i % 2 == 0);
        }
        assert_eq!(cache.len(), 6);
        let evicted = cache.make_room(|_, keep| *keep);
        let evicted: Vec<_> = evicted.into_iter().map(|(k, _)| k).collect();
        assert_eq!(evicted, vec![1, 3, 5]);
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![0, 2, 4]);
    }

    #[test]
    fn slots_are_reused() {
        let mut cache = LruCache::new(1, 1).unwrap().manual();
        cache.insert("a", 1);
        cache.pop(&"a");
        cache.insert("b", 2);
        assert_eq!(cache.nodes.len(), 1);
        assert_eq!(cache.peek(&"b"), Some(&2));
    }
}
