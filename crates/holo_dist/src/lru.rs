//! Index-linked LRU map shared by the routing caches.
//!
//! Not synchronized; owners wrap it in a lock.

use std::collections::HashMap;
use std::hash::Hash;

pub struct LruMap<K, V> {
    map: HashMap<K, usize>,
    entries: Vec<Entry<K, V>>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,
}

struct Entry<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> LruMap<K, V> {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::new(),
            entries: Vec::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        Some(&self.entries[idx].value)
    }

    /// Insert or replace `key`. Returns the least recently used entry if it
    /// had to be evicted to make room.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.map.get(&key) {
            self.entries[idx].value = value;
            self.move_to_front(idx);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.tail.map(|tail| self.remove_index(tail))
        } else {
            None
        };

        let idx = self.entries.len();
        let old_head = self.head;
        self.entries.push(Entry {
            key: key.clone(),
            value,
            prev: None,
            next: old_head,
        });
        if let Some(old_head) = old_head {
            self.entries[old_head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.map.insert(key, idx);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = *self.map.get(key)?;
        Some(self.remove_index(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.entries[idx].prev = None;
        self.entries[idx].next = self.head;
        if let Some(old_head) = self.head {
            self.entries[old_head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.entries[idx].prev;
        let next = self.entries[idx].next;
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
    }

    /// Unlink and drop the entry at `idx`, patching the links of the entry
    /// moved into its slot by `swap_remove`.
    fn remove_index(&mut self, idx: usize) -> (K, V) {
        self.unlink(idx);
        let entry = self.entries.swap_remove(idx);
        self.map.remove(&entry.key);

        if idx < self.entries.len() {
            let moved_key = self.entries[idx].key.clone();
            self.map.insert(moved_key, idx);
            match self.entries[idx].prev {
                Some(prev) => self.entries[prev].next = Some(idx),
                None => self.head = Some(idx),
            }
            match self.entries[idx].next {
                Some(next) => self.entries[next].prev = Some(idx),
                None => self.tail = Some(idx),
            }
        }
        (entry.key, entry.value)
    }
}
