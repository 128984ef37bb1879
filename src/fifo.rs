//! FIFO shard policy.
//!
//! A hash index maps each key to its value and list node; the intrusive
//! list orders entries by insertion. Lookups never touch the list, so the
//! read path shares the index read lock and nothing else. Eviction runs
//! synchronously on the inserting thread: unlink the tail under the list
//! mutex, then drop the index entry.
//!
//! Overshoot: `usage` may transiently exceed capacity under a heavy insert
//! load. Rather than have every inserter evict at once (and underfill the
//! shard), a single compare-exchange claims the right to repair one entry
//! of overshoot per insert.

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

/// One FIFO shard.
pub struct FifoCache<V> {
    capacity: u64,
    usage: AtomicU64,
    index: RwLock<HashMap<u64, IndexEntry<V>>>,
    list: Mutex<List>,
    stats: Statistics,
}

// SAFETY: the raw node pointers in the index are only dereferenced under
// the shard's locking discipline (index guard held, list edits under the
// list mutex); nodes are owned by the list and freed exactly once by the
// path that removes the index entry.
unsafe impl<V: Send> Send for FifoCache<V> {}
unsafe impl<V: Send + Sync> Sync for FifoCache<V> {}

impl<V: Clone> FifoCache<V> {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            usage: AtomicU64::new(0),
            index: RwLock::new(HashMap::new()),
            list: Mutex::new(List::new()),
            stats: Statistics::new(),
        }
    }

    /// Unlink the tail node and drop its index entry. Requires the index
    /// write guard, which also serializes this against erase.
    fn evict_one(&self, map: &mut HashMap<u64, IndexEntry<V>>) {
        let node = {
            let mut list = self.list.lock();
            let node = list.back();
            if list.is_sentinel(node) {
                tracing::warn!("fifo: eviction requested on an empty list");
                return;
            }
            // SAFETY: `node` is a real node linked in this list.
            unsafe { list.detach(node) };
            node
        };
        // SAFETY: detached above; freed below by whichever branch owns it.
        let key = unsafe { (*node).key };
        if map.remove(&key).is_some() {
            unsafe { Node::free(node) };
        } else {
            // The index released this key independently; the orphaned node
            // is still ours to reclaim.
            tracing::warn!(key, "fifo: evicted key presumably unreachable");
            unsafe { Node::free(node) };
        }
    }
}

impl<V: Clone + Send + Sync> CachePolicy<V> for FifoCache<V> {
    fn lookup(&self, key: u64) -> Option<V> {
        let stat_yes = self.stats.sample();
        let map = self.index.read();
        match map.get(&key) {
            Some(entry) => {
                let value = entry.value.clone();
                if stat_yes {
                    self.stats.record(Ticker::CacheHit);
                }
                Some(value)
            }
            None => {
                if stat_yes {
                    self.stats.record(Ticker::CacheMiss);
                }
                None
            }
        }
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
            // Claim the right to repair one entry of overshoot; losers do
            // nothing and the next insert retries.
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
            // SAFETY: the node is live (we owned its index entry); detach
            // only if no eviction got to it first.
            unsafe {
                if Node::is_in_list(node) {
                    list.detach(node);
                }
            }
        }
        // SAFETY: detached, index entry removed; we own the free.
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
