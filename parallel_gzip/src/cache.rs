//! Bounded LRU cache for finalized chunks.
//!
//! Plain slab plus intrusive recency list: lookup, insert, and eviction are
//! all O(1). The cache is small (a couple dozen chunks), but it sits on the
//! consumer's hot path, so no per-access allocation or scan.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    /// `Some` while the slot is live, `None` while on the free list.
    value: Option<V>,
    prev: usize,
    next: usize,
}

pub struct LruCache<K: Eq + Hash + Clone, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used, evicted first.
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            map: HashMap::with_capacity(capacity + 1),
            slots: Vec::with_capacity(capacity + 1),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Looks a value up and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.map.get(key)?;
        self.detach(slot);
        self.push_front(slot);
        self.slots[slot].value.as_ref()
    }

    /// Looks a value up without touching the recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map
            .get(key)
            .and_then(|&slot| self.slots[slot].value.as_ref())
    }

    /// Inserts a value, replacing any previous one under the same key.
    /// Returns the evicted least-recently-used entry when the cache was
    /// full.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.map.get(&key) {
            self.slots[slot].value = Some(value);
            self.detach(slot);
            self.push_front(slot);
            return None;
        }

        let evicted = if self.len() >= self.capacity {
            let victim = self.tail;
            self.detach(victim);
            self.map.remove(&self.slots[victim].key);
            self.free.push(victim);
            let old_key = self.slots[victim].key.clone();
            let old_value = self.slots[victim].value.take().expect("live slot");
            Some((old_key, old_value))
        } else {
            None
        };

        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Slot {
                key: key.clone(),
                value: Some(value),
                prev: NIL,
                next: NIL,
            };
            slot
        } else {
            self.slots.push(Slot {
                key: key.clone(),
                value: Some(value),
                prev: NIL,
                next: NIL,
            });
            self.slots.len() - 1
        };
        self.map.insert(key, slot);
        self.push_front(slot);
        evicted
    }

    /// Removes an entry, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.map.remove(key)?;
        self.detach(slot);
        self.free.push(slot);
        self.slots[slot].value.take()
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else if self.tail == slot {
            self.tail = prev;
        }
        self.slots[slot].prev = NIL;
        self.slots[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(3);
        assert!(cache.insert(1, "a").is_none());
        assert!(cache.insert(2, "b").is_none());
        assert!(cache.insert(3, "c").is_none());

        // Touch 1 so 2 becomes the victim.
        assert_eq!(cache.get(&1), Some(&"a"));
        let evicted = cache.insert(4, "d");
        assert_eq!(evicted, Some((2, "b")));
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn replacing_updates_in_place() {
        let mut cache = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert!(cache.insert(1, "a2").is_none());
        assert_eq!(cache.len(), 2);
        // 2 is now the LRU entry.
        assert_eq!(cache.insert(3, "c"), Some((2, "b")));
        assert_eq!(cache.peek(&1), Some(&"a2"));
    }

    #[test]
    fn remove_frees_capacity() {
        let mut cache = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert_eq!(cache.remove(&1), Some("a"));
        assert_eq!(cache.len(), 1);
        assert!(cache.insert(3, "c").is_none());
        assert!(cache.insert(4, "d").is_some());
    }

    #[test]
    fn heavy_churn_keeps_list_consistent() {
        let mut cache = LruCache::new(8);
        for i in 0..1000u32 {
            cache.insert(i % 13, i);
            if i % 3 == 0 {
                cache.get(&(i % 7));
            }
            if i % 11 == 0 {
                cache.remove(&(i % 5));
            }
            assert!(cache.len() <= 8);
        }
    }
}
