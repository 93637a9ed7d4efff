//! A capacity-bounded recency cache that passes over pinned entries when
//! looking for an eviction victim ("polite" because it never evicts
//! something a caller is still using).
//!
//! Built as an index-based arena with an intrusive doubly linked recency
//! list, rather than `Rc`/`RefCell` nodes — the arena-of-ids technique the
//! project's design notes recommend for structures that would otherwise
//! need shared, cyclic ownership.

use std::collections::HashMap;
use std::hash::Hash;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Generic capacity-bounded `K -> V` cache with a pin predicate.
///
/// Not thread-safe: callers hold an external lock across `get_or_insert_with`,
/// pin-state mutations, and explicit removals.
pub struct PoliteLru<K, V> {
    capacity: usize,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    /// Most-recently-used end of the list.
    head: Option<usize>,
    /// Least-recently-used end of the list.
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> PoliteLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        PoliteLru {
            capacity,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&i| &self.slots[i].as_ref().unwrap().value)
    }

    /// Remove `key` unconditionally (used by forced purges, e.g. on a
    /// watcher event that invalidates cached state regardless of pins).
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let slot = self.slots[idx].take().unwrap();
        self.free.push(idx);
        Some(slot.value)
    }

    /// Fetch `key`, constructing it via `loader` on miss and moving it to
    /// most-recent on either path. `can_purge(k)` decides, during the
    /// capacity-eviction walk, whether an existing least-recent entry may be
    /// evicted; entries it refuses are promoted to most-recent instead, and
    /// scanning continues over the next-least-recent entry. If no entry is
    /// purgeable, the cache is allowed to temporarily exceed capacity.
    ///
    /// The loader runs with the external lock held (by contract); on
    /// failure the cache retains no partial entry for `key`.
    pub fn get_or_insert_with<F, P>(&mut self, key: &K, loader: F, can_purge: P) -> anyhow::Result<&V>
    where
        F: FnOnce() -> anyhow::Result<V>,
        P: Fn(&K) -> bool,
    {
        if let Some(&idx) = self.index.get(key) {
            self.touch(idx);
            return Ok(&self.slots[idx].as_ref().unwrap().value);
        }

        let value = loader()?;
        let idx = self.insert_front(key.clone(), value);
        self.evict_over_capacity(&can_purge, idx);
        Ok(&self.slots[idx].as_ref().unwrap().value)
    }

    /// Capacity-triggered eviction walk from least- to more-recent,
    /// skipping `protect` (the entry that was just inserted).
    fn evict_over_capacity<P>(&mut self, can_purge: &P, protect: usize)
    where
        P: Fn(&K) -> bool,
    {
        if self.index.len() <= self.capacity {
            return;
        }

        // Bound the walk by the current size: every node is visited at
        // most once per call, whether purged or promoted.
        let mut steps = self.index.len();
        while self.index.len() > self.capacity && steps > 0 {
            steps -= 1;
            let Some(victim) = self.tail else { break };
            if victim == protect {
                // Nothing else left to consider; cache exceeds capacity.
                break;
            }
            let victim_key = self.slots[victim].as_ref().unwrap().key.clone();
            if can_purge(&victim_key) {
                self.index.remove(&victim_key);
                self.unlink(victim);
                self.slots[victim] = None;
                self.free.push(victim);
            } else {
                self.touch(victim);
            }
        }
    }

    fn insert_front(&mut self, key: K, value: V) -> usize {
        let idx = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        self.slots[idx] = Some(Slot { key: key.clone(), value, prev: None, next: self.head });
        if let Some(h) = self.head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.index.insert(key, idx);
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        let slot = self.slots[idx].as_mut().unwrap();
        slot.prev = None;
        slot.next = self.head;
        if let Some(h) = self.head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn ok(n: i32) -> anyhow::Result<i32> {
        Ok(n)
    }

    #[test]
    fn miss_then_hit_does_not_reload() {
        let mut lru: PoliteLru<&str, i32> = PoliteLru::new(2);
        let loads = RefCell::new(0);

        lru.get_or_insert_with(&"a", || { *loads.borrow_mut() += 1; ok(1) }, |_| true).unwrap();
        lru.get_or_insert_with(&"a", || { *loads.borrow_mut() += 1; ok(99) }, |_| true).unwrap();

        assert_eq!(*loads.borrow(), 1);
        assert_eq!(*lru.peek(&"a").unwrap(), 1);
    }

    #[test]
    fn evicts_least_recently_used_when_unpinned() {
        let mut lru: PoliteLru<&str, i32> = PoliteLru::new(2);
        lru.get_or_insert_with(&"a", || ok(1), |_| true).unwrap();
        lru.get_or_insert_with(&"b", || ok(2), |_| true).unwrap();
        lru.get_or_insert_with(&"c", || ok(3), |_| true).unwrap();

        assert_eq!(lru.len(), 2);
        assert!(!lru.contains(&"a"));
        assert!(lru.contains(&"b"));
        assert!(lru.contains(&"c"));
    }

    #[test]
    fn pinned_entry_survives_eviction_pressure() {
        let mut lru: PoliteLru<&str, i32> = PoliteLru::new(2);
        let pinned = "a";
        lru.get_or_insert_with(&"a", || ok(1), |_| true).unwrap();
        lru.get_or_insert_with(&"b", || ok(2), |_| true).unwrap();

        let can_purge = |k: &&str| *k != pinned;
        lru.get_or_insert_with(&"c", || ok(3), can_purge).unwrap();

        // "a" is pinned so it must survive; "b" becomes the eviction victim
        // instead (it gets promoted past once, then evicted on later scans).
        assert!(lru.contains(&"a"));
        assert!(lru.contains(&"c"));
    }

    #[test]
    fn cache_may_exceed_capacity_if_nothing_purgeable() {
        let mut lru: PoliteLru<&str, i32> = PoliteLru::new(1);
        lru.get_or_insert_with(&"a", || ok(1), |_| false).unwrap();
        lru.get_or_insert_with(&"b", || ok(2), |_| false).unwrap();

        assert_eq!(lru.len(), 2);
        assert!(lru.contains(&"a"));
        assert!(lru.contains(&"b"));
    }

    #[test]
    fn failed_loader_leaves_no_partial_entry() {
        let mut lru: PoliteLru<&str, i32> = PoliteLru::new(2);
        let result = lru.get_or_insert_with(&"a", || anyhow::bail!("boom"), |_| true);
        assert!(result.is_err());
        assert!(!lru.contains(&"a"));
    }

    #[test]
    fn remove_is_unconditional() {
        let mut lru: PoliteLru<&str, i32> = PoliteLru::new(2);
        lru.get_or_insert_with(&"a", || ok(1), |_| false).unwrap();
        assert!(lru.remove(&"a").is_some());
        assert!(!lru.contains(&"a"));
    }
}
