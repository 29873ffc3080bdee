//! Two-queue (2Q) cache.
//!
//! Entries live in an arena and are threaded through three index-linked
//! queues: `A1In` (probationary), `A1Out` (ghosts of entries evicted from
//! `A1In`) and `Am` (hot). A repeat reference from either `A1In` or `A1Out`
//! promotes straight to `Am`, so a one-pass scan never displaces the hot set.

use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;

use crate::config::CacheConfig;

/// Sentinel index for "no neighbour".
const NIL: usize = usize::MAX;

/// Queue membership of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueTag {
    A1In,
    A1Out,
    Am,
}

impl QueueTag {
    #[inline]
    fn slot(self) -> usize {
        match self {
            QueueTag::A1In => 0,
            QueueTag::A1Out => 1,
            QueueTag::Am => 2,
        }
    }
}

/// A cached value plus its queue bookkeeping.
#[derive(Debug)]
pub struct CacheEntry<K, V> {
    key: K,
    value: V,
    tag: QueueTag,
    weight: usize,
    linked: bool,
    prev: usize,
    next: usize,
}

impl<K, V> CacheEntry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn tag(&self) -> QueueTag {
        self.tag
    }

    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Whether the entry currently sits in one of the queues.
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

#[derive(Debug, Clone, Copy)]
struct Queue {
    head: usize,
    tail: usize,
    len: usize,
    weight: usize,
}

impl Queue {
    const EMPTY: Queue = Queue {
        head: NIL,
        tail: NIL,
        len: 0,
        weight: 0,
    };
}

/// Counters for cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits on entries found in the ghost queue.
    pub ghost_hits: u64,
    /// Moves from `A1In` to `A1Out`.
    pub probationary_evictions: u64,
    /// Entries dropped from the cache entirely.
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct TwoQueueCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<CacheEntry<K, V>>>,
    free: Vec<usize>,
    queues: [Queue; 3],
    am_capacity: usize,
    a1_in_capacity: usize,
    a1_out_capacity: Option<usize>,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V> TwoQueueCache<K, V> {
    pub fn new(am_capacity: usize, a1_in_capacity: usize, a1_out_capacity: Option<usize>) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            queues: [Queue::EMPTY; 3],
            am_capacity: am_capacity.max(1),
            a1_in_capacity: a1_in_capacity.max(1),
            a1_out_capacity,
            stats: CacheStats::default(),
        }
    }

    /// Cache with `A1In` at a quarter of `Am` and an unbounded ghost queue.
    pub fn with_capacity(am_capacity: usize) -> Self {
        Self::new(am_capacity, (am_capacity / 4).max(1), None)
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.am_capacity,
            config.effective_a1_in(),
            config.a1_out_capacity,
        )
    }

    /// Number of entries known to the cache, ghosts included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn queue_len(&self, tag: QueueTag) -> usize {
        self.queues[tag.slot()].len
    }

    pub fn queue_weight(&self, tag: QueueTag) -> usize {
        self.queues[tag.slot()].weight
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Add an entry to the lookup map with weight 1. See [`insert_weighted`](Self::insert_weighted).
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_weighted(key, value, 1)
    }

    /// Add an entry to the lookup map without placing it in a queue.
    ///
    /// New entries start tagged `A1In`; call [`attach`](Self::attach) to
    /// queue them. If the key is already present its value and weight are
    /// replaced in place and the old value returned; the queue's capacity is
    /// enforced again on the next `attach`.
    pub fn insert_weighted(&mut self, key: K, value: V, weight: usize) -> Option<V> {
        let weight = weight.max(1);
        if let Some(&idx) = self.map.get(&key)
            && let Some(entry) = self.slots[idx].as_mut()
        {
            if entry.linked {
                let queue = &mut self.queues[entry.tag.slot()];
                queue.weight = queue.weight - entry.weight + weight;
            }
            entry.weight = weight;
            return Some(std::mem::replace(&mut entry.value, value));
        }

        let entry = CacheEntry {
            key: key.clone(),
            value,
            tag: QueueTag::A1In,
            weight,
            linked: false,
            prev: NIL,
            next: NIL,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };

        self.map.insert(key, idx);
        None
    }

    /// Queue an entry according to its tag, then enforce that queue's capacity.
    ///
    /// `on_evict(true, entry)` fires when an entry is demoted from `A1In` to
    /// the ghost queue; `on_evict(false, entry)` fires just before an entry
    /// is dropped from the cache. Returns `false` if the key is unknown.
    pub fn attach<F>(&mut self, key: &K, mut on_evict: F) -> bool
    where
        F: FnMut(bool, &CacheEntry<K, V>),
    {
        let Some(&idx) = self.map.get(key) else {
            return false;
        };
        let Some(tag) = self.slots[idx].as_ref().map(|e| e.tag) else {
            return false;
        };

        self.unlink(idx);
        self.link_back(idx, tag);
        self.enforce_capacity(tag, &mut on_evict);
        true
    }

    /// Look up an entry, unlinking it from its queue.
    ///
    /// Any linked entry found in `A1In` or `A1Out` is promoted to `Am`. The
    /// caller re-attaches the entry to refresh its position.
    pub fn get(&mut self, key: &K) -> Option<&mut CacheEntry<K, V>> {
        let Some(&idx) = self.map.get(key) else {
            self.stats.misses += 1;
            return None;
        };

        let (linked, tag) = self.slots[idx].as_ref().map(|e| (e.linked, e.tag))?;
        if linked {
            self.unlink(idx);
            if tag == QueueTag::A1Out {
                self.stats.ghost_hits += 1;
            }
            if let Some(entry) = self.slots[idx].as_mut() {
                entry.tag = QueueTag::Am;
            }
        }

        self.stats.hits += 1;
        self.slots[idx].as_mut()
    }

    /// Pure lookup, no queue movement.
    pub fn has_entry(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Peek at an entry without promoting it.
    pub fn get_ref(&self, key: &K) -> Option<&CacheEntry<K, V>> {
        self.map
            .get(key)
            .and_then(|&idx| self.slots[idx].as_ref())
    }

    pub fn tag_of(&self, key: &K) -> Option<QueueTag> {
        self.get_ref(key).map(|e| e.tag)
    }

    /// Unlink and erase an entry, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = *self.map.get(key)?;
        self.erase(idx).map(|entry| entry.value)
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&CacheEntry<K, V>),
    {
        for entry in self.slots.iter().flatten() {
            f(entry);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.queues = [Queue::EMPTY; 3];
    }

    fn enforce_capacity<F>(&mut self, tag: QueueTag, on_evict: &mut F)
    where
        F: FnMut(bool, &CacheEntry<K, V>),
    {
        match tag {
            QueueTag::A1In => {
                let mut demoted = false;
                while self.queues[QueueTag::A1In.slot()].weight > self.a1_in_capacity {
                    let Some(idx) = self.pop_front(QueueTag::A1In) else {
                        break;
                    };
                    if let Some(entry) = self.slots[idx].as_mut() {
                        entry.tag = QueueTag::A1Out;
                        on_evict(true, entry);
                    }
                    self.link_back(idx, QueueTag::A1Out);
                    self.stats.probationary_evictions += 1;
                    demoted = true;
                    tracing::trace!(slot = idx, "demoted entry to ghost queue");
                }
                if demoted {
                    self.enforce_capacity(QueueTag::A1Out, on_evict);
                }
            }
            QueueTag::A1Out => {
                let Some(capacity) = self.a1_out_capacity else {
                    return;
                };
                self.evict_while_over(QueueTag::A1Out, capacity, on_evict);
            }
            QueueTag::Am => {
                self.evict_while_over(QueueTag::Am, self.am_capacity, on_evict);
            }
        }
    }

    fn evict_while_over<F>(&mut self, tag: QueueTag, capacity: usize, on_evict: &mut F)
    where
        F: FnMut(bool, &CacheEntry<K, V>),
    {
        while self.queues[tag.slot()].weight > capacity {
            let Some(idx) = self.pop_front(tag) else {
                break;
            };
            if let Some(entry) = self.erase(idx) {
                on_evict(false, &entry);
                self.stats.evictions += 1;
                tracing::trace!(queue = ?tag, "evicted entry");
            }
        }
    }

    fn link_back(&mut self, idx: usize, tag: QueueTag) {
        let queue = &mut self.queues[tag.slot()];
        let tail = queue.tail;

        let Some(entry) = self.slots[idx].as_mut() else {
            return;
        };
        entry.tag = tag;
        entry.linked = true;
        entry.prev = tail;
        entry.next = NIL;
        let weight = entry.weight;

        if tail != NIL {
            if let Some(prev) = self.slots[tail].as_mut() {
                prev.next = idx;
            }
        } else {
            queue.head = idx;
        }

        queue.tail = idx;
        queue.len += 1;
        queue.weight += weight;
    }

    fn unlink(&mut self, idx: usize) {
        let Some(entry) = self.slots[idx].as_mut() else {
            return;
        };
        if !entry.linked {
            return;
        }

        let (prev, next, tag, weight) = (entry.prev, entry.next, entry.tag, entry.weight);
        entry.linked = false;
        entry.prev = NIL;
        entry.next = NIL;

        let queue = &mut self.queues[tag.slot()];
        if prev != NIL {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = next;
            }
        } else {
            queue.head = next;
        }

        if next != NIL {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = prev;
            }
        } else {
            queue.tail = prev;
        }

        queue.len -= 1;
        queue.weight -= weight;
    }

    fn pop_front(&mut self, tag: QueueTag) -> Option<usize> {
        let head = self.queues[tag.slot()].head;
        if head == NIL {
            return None;
        }
        self.unlink(head);
        Some(head)
    }

    fn erase(&mut self, idx: usize) -> Option<CacheEntry<K, V>> {
        self.unlink(idx);
        let entry = self.slots[idx].take()?;
        self.map.remove(&entry.key);
        self.free.push(idx);
        Some(entry)
    }
}
