//! Byte-budgeted LRU engine.
//!
//! Not synchronized; the concurrent wrapper in [`crate::cache`] provides
//! mutual exclusion. Recency is tracked with an index-linked list over a
//! slab of nodes, so touch, insert, and evict are all O(1) beyond the key
//! hash.

use std::collections::HashMap;

/// A value that knows its size in bytes.
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weighted for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

type Index = usize;

struct Node<V> {
    key: String,
    value: V,
    prev: Option<Index>,
    next: Option<Index>,
}

/// LRU cache bounded by total bytes.
///
/// An entry accounts for `key.len() + value.weight()` bytes. After every
/// insert, entries are evicted from the cold end while the budget is
/// exceeded; a budget of zero disables eviction.
pub struct LruCache<V: Weighted> {
    max_bytes: usize,
    used_bytes: usize,
    nodes: Vec<Option<Node<V>>>,
    free: Vec<Index>,
    /// Most recently used.
    head: Option<Index>,
    /// Least recently used.
    tail: Option<Index>,
    index: HashMap<String, Index>,
    on_evict: Option<Box<dyn FnMut(&str, &V) + Send>>,
}

impl<V: Weighted> LruCache<V> {
    /// Create a cache with a byte budget. `max_bytes == 0` means unbounded.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
            on_evict: None,
        }
    }

    /// Register a callback invoked with each entry as it is evicted or
    /// removed from the cold end.
    pub fn with_eviction_callback(
        max_bytes: usize,
        on_evict: impl FnMut(&str, &V) + Send + 'static,
    ) -> Self {
        Self {
            on_evict: Some(Box::new(on_evict)),
            ..Self::new(max_bytes)
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes currently accounted for.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Insert or update an entry and mark it most recently used.
    ///
    /// Updating an existing key adjusts the byte accounting by the size
    /// delta of the value. Eviction runs after the write until the budget
    /// holds again.
    pub fn insert(&mut self, key: &str, value: V) {
        if let Some(&idx) = self.index.get(key) {
            let node = self.nodes[idx].as_mut().expect("indexed node missing");
            self.used_bytes = self.used_bytes + value.weight() - node.value.weight();
            node.value = value;
            self.move_to_head(idx);
        } else {
            self.used_bytes += key.len() + value.weight();
            let idx = self.alloc(Node {
                key: key.to_string(),
                value,
                prev: None,
                next: None,
            });
            self.index.insert(key.to_string(), idx);
            self.push_head(idx);
        }
        while self.max_bytes != 0 && self.used_bytes > self.max_bytes {
            self.remove_oldest();
        }
    }

    /// Look up a key, marking it most recently used on a hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.move_to_head(idx);
        self.nodes[idx].as_ref().map(|n| &n.value)
    }

    /// Evict the least recently used entry, invoking the eviction callback.
    pub fn remove_oldest(&mut self) {
        let Some(idx) = self.tail else { return };
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("tail node missing");
        self.free.push(idx);
        self.index.remove(&node.key);
        self.used_bytes -= node.key.len() + node.value.weight();
        if let Some(on_evict) = self.on_evict.as_mut() {
            on_evict(&node.key, &node.value);
        }
    }

    fn alloc(&mut self, node: Node<V>) -> Index {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn push_head(&mut self, idx: Index) {
        let node = self.nodes[idx].as_mut().expect("node missing");
        node.prev = None;
        node.next = self.head;
        if let Some(old_head) = self.head {
            self.nodes[old_head].as_mut().expect("head missing").prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: Index) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("node missing");
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().expect("prev missing").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().expect("next missing").prev = prev,
            None => self.tail = prev,
        }
    }

    fn move_to_head(&mut self, idx: Index) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_head(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn get_hits_and_misses() {
        let mut cache: LruCache<String> = LruCache::new(0);
        cache.insert("key1", "1234".to_string());
        assert_eq!(cache.get("key1"), Some(&"1234".to_string()));
        assert_eq!(cache.get("key2"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn oldest_entry_is_evicted_when_over_budget() {
        // Budget fits exactly two of the three (key, value) pairs.
        let cap = "k1".len() + "v1".len() + "k2".len() + "v2".len();
        let mut cache: LruCache<String> = LruCache::new(cap);
        cache.insert("k1", "v1".to_string());
        cache.insert("k2", "v2".to_string());
        cache.insert("k3", "v3".to_string());

        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.used_bytes() <= cap);
    }

    #[test]
    fn get_refreshes_recency() {
        let cap = 2 * ("kx".len() + "vx".len());
        let mut cache: LruCache<String> = LruCache::new(cap);
        cache.insert("k1", "v1".to_string());
        cache.insert("k2", "v2".to_string());
        // Touch k1 so k2 becomes the eviction candidate.
        assert!(cache.get("k1").is_some());
        cache.insert("k3", "v3".to_string());

        assert!(cache.get("k1").is_some());
        assert_eq!(cache.get("k2"), None);
    }

    #[test]
    fn update_adjusts_used_bytes_by_delta() {
        let mut cache: LruCache<String> = LruCache::new(0);
        cache.insert("k", "aa".to_string());
        let before = cache.used_bytes();
        cache.insert("k", "aaaa".to_string());
        assert_eq!(cache.used_bytes(), before + 2);
        cache.insert("k", "a".to_string());
        assert_eq!(cache.used_bytes(), before - 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_callback_sees_removed_entries() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cap = "k1".len() + "v1".len() + "k2".len() + "v2".len();
        let mut cache = LruCache::with_eviction_callback(cap, move |key, _: &String| {
            sink.lock().unwrap().push(key.to_string());
        });
        cache.insert("k1", "v1".to_string());
        cache.insert("k2", "v2".to_string());
        cache.insert("k3", "v3".to_string());
        cache.insert("k4", "v4".to_string());

        assert_eq!(*evicted.lock().unwrap(), vec!["k1", "k2"]);
    }

    #[test]
    fn budget_holds_under_arbitrary_workload() {
        let cap = 64;
        let mut cache: LruCache<Vec<u8>> = LruCache::new(cap);
        for i in 0..200 {
            cache.insert(&format!("key-{i}"), vec![0u8; i % 17]);
            if i % 3 == 0 {
                cache.get(&format!("key-{}", i / 2));
            }
            assert!(cache.used_bytes() <= cap, "budget exceeded at step {i}");
        }
    }

    #[test]
    fn remove_oldest_on_empty_cache_is_a_no_op() {
        let mut cache: LruCache<String> = LruCache::new(8);
        cache.remove_oldest();
        assert_eq!(cache.len(), 0);
    }
}
