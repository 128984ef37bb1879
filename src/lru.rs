//! LRU shard policy.
//!
//! Structurally identical to the FIFO shard with one change: a successful
//! lookup re-promotes the node to the list head, and the list mutex is
//! taken with a non-blocking `try_lock`. Under contention the promotion is
//! simply skipped: LRU is approximated, never blocked. The detached-marker
//! check prevents promoting a node that an eviction has already unlinked.

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::list::{List, Node};
use crate::policy::CachePolicy;
use crate::stats::{Statistics, Ticker};

struct IndexEntry<V> {
    value: V,
    node: *mut Node,
}

/// One LRU shard.
pub struct LruCache<V> {
    capacity: u64,
    usage: AtomicU64,
    index: RwLock<HashMap<u64, IndexEntry<V>>>,
    list: Mutex<List>,
    stats: Statistics,
}

// SAFETY: same discipline as FifoCache: node pointers are dereferenced
// only while the index guard pins the entry, structural edits happen under
// the list mutex, and the path removing the index entry owns the free.
unsafe impl<V: Send> Send for LruCache<V> {}
unsafe impl<V: Send + Sync> Sync for LruCache<V> {}

impl<V: Clone> LruCache<V> {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            usage: AtomicU64::new(0),
            index: RwLock::new(HashMap::new()),
            list: Mutex::new(List::new()),
            stats: Statistics::new(),
        }
    }

    fn evict_one(&self, map: &mut HashMap<u64, IndexEntry<V>>) {
        let node = {
            let mut list = self.list.lock();
            let node = list.back();
            if list.is_sentinel(node) {
                tracing::warn!("lru: eviction requested on an empty list");
                return;
            }
            // SAFETY: real node linked in this list.
            unsafe { list.detach(node) };
            node
        };
        let key = unsafe { (*node).key };
        if map.remove(&key).is_none() {
            tracing::warn!(key, "lru: evicted key presumably unreachable");
        }
        // SAFETY: detached; the index no longer references it.
        unsafe { Node::free(node) };
    }
}

impl<V: Clone + Send + Sync> CachePolicy<V> for LruCache<V> {
    fn lookup(&self, key: u64) -> Option<V> {
        let stat_yes = self.stats.sample();
        let map = self.index.read();
        let Some(entry) = map.get(&key) else {
            if stat_yes {
                self.stats.record(Ticker::CacheMiss);
            }
            return None;
        };
        let value = entry.value.clone();
        let node = entry.node;
        // Acquire the list mutex, but don't block if it is already held:
        // a skipped promotion costs accuracy, not correctness.
        if let Some(mut list) = self.list.try_lock() {
            // SAFETY: the index read guard pins the entry, so `node` is
            // live; the marker check skips nodes mid-eviction.
            unsafe {
                if Node::is_in_list(node) {
                    list.detach(node);
                    list.push_front(node);
                }
            }
        }
        drop(map);
        if stat_yes {
            self.stats.record(Ticker::CacheHit);
        }
        Some(value)
    }

    fn insert(&self, key: u64, value: V) -> bool {
        if self.stats.sample() {
            self.stats.record(Ticker::Insert);
        }

        let node = Node::alloc(key);
        let mut map = self.index.write();
        let updated = match map.entry(key) {
            hashbrown::hash_map::Entry::Occupied(mut occupied) => {
                occupied.get_mut().value = value;
                true
            }
            hashbrown::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(IndexEntry { value, node });
                false
            }
        };
        if updated {
            drop(map);
            // SAFETY: never linked.
            unsafe { Node::free(node) };
            return false;
        }

        let s = self.usage.load(Ordering::Relaxed);
        let mut done = false;
        if s >= self.capacity {
            self.evict_one(&mut map);
            done = true;
        }

        {
            let mut list = self.list.lock();
            // SAFETY: freshly allocated, not yet linked.
            unsafe { list.push_front(node) };
        }
        drop(map);

        let mut s = s;
        if !done {
            self.usage.fetch_add(1, Ordering::Relaxed);
            s = self.usage.load(Ordering::Relaxed);
        }
        if s > self.capacity {
            if self
                .usage
                .compare_exchange(s, s - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let mut map = self.index.write();
                self.evict_one(&mut map);
            }
        }
        true
    }

    fn erase(&self, key: u64) -> bool {
        let mut map = self.index.write();
        let Some(entry) = map.remove(&key) else {
            return false;
        };
        let node = entry.node;
        {
            let mut list = self.list.lock();
            // SAFETY: node is live; skip detach if an eviction raced us.
            unsafe {
                if Node::is_in_list(node) {
                    list.detach(node);
                }
            }
        }
        // SAFETY: detached and unindexed.
        unsafe { Node::free(node) };
        drop(map);
        self.usage.fetch_sub(1, Ordering::Relaxed);
        true
    }

    fn size(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    fn is_full(&self) -> bool {
        self.usage.load(Ordering::Relaxed) >= self.capacity
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}
