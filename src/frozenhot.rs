//! FrozenHot two-tier shard policy.
//!
//! For workloads with a stable hot set, the dynamic LRU list's per-access
//! promotion cost dominates. This policy periodically freezes the hottest
//! slice of the LRU into a read-only open-addressed table (the *fast
//! tier*); lookups for frozen keys hit without any list work. When the
//! working set drifts, the controller tears the fast tier down and
//! rebuilds it.
//!
//! The shard is in exactly one of six states, tracked by atomic flags:
//!
//! | state            | ready | construct | frozen_all | insert | curve |
//! |------------------|-------|-----------|------------|--------|-------|
//! | Dynamic          |  f    |  f        |  f         |  t     |  f    |
//! | Profiling-curve  |  f    |  f        |  f         |  t     |  t    |
//! | Constructing     |  f    |  t        |  f         |  t/f   |  f    |
//! | Frozen-partial   |  t    |  f        |  f         |  t     |  f    |
//! | Frozen-all       |  t    |  f        |  t         |  f     |  f    |
//! | Deconstructing   |  f    |  f        |  f         |  t     |  f    |
//!
//! Inserts stay enabled while a *partial* tier is constructed: every insert
//! arriving during construction charges the dynamic tier's eviction budget
//! (`eviction_counter`), and exhausting that budget flips the construction
//! into frozen-all. `construct_tier` disables inserts up front.
//!
//! Reserved keys: `0` is the sentinel null key, [`TOMB_KEY`] marks deferred
//! removals, [`MARKER_KEY`] is the curve-profiling cursor. Real keys must
//! avoid all three when this policy is in use.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::clock;
use crate::fast_hash::FastTable;
use crate::list::{List, Node};
use crate::policy::{CachePolicy, CurvePoint};
use crate::stats::{Statistics, Ticker};

/// Reserved key marking a deferred-erased list node.
pub const TOMB_KEY: u64 = 1;
/// Reserved key of the curve-profiling marker node.
pub const MARKER_KEY: u64 = 2;

const CURVE_MAX_POINTS: usize = 45;
const CURVE_SATURATION: f64 = 0.992;
const CURVE_FC_HIT_CEILING: f64 = 0.9;
const CURVE_POLL: std::time::Duration = std::time::Duration::from_millis(1);

struct IndexEntry<V> {
    value: V,
    node: *mut Node,
}

/// Both intrusive lists and the marker share one mutex: the main (dynamic)
/// list and the fast list the frozen nodes are parked on.
struct Lists {
    main: List,
    fast: List,
    marker: *mut Node,
}

// SAFETY: Lists is only accessed through the shard's mutex.
unsafe impl Send for Lists {}

/// One FrozenHot shard.
pub struct FrozenHotCache<V> {
    capacity: u64,
    usage: AtomicU64,
    index: RwLock<HashMap<u64, IndexEntry<V>>>,
    lists: Mutex<Lists>,
    fast: RwLock<FastTable<V>>,

    fast_cache_ready: AtomicBool,
    frozen_all: AtomicBool,
    fast_cache_construct: AtomicBool,
    enable_insert: AtomicBool,
    curve_flag: AtomicBool,

    /// Stamp of the marker node, mirrored here so the lock-free lookup path
    /// can compare recency without dereferencing the marker.
    marker_time: AtomicU64,
    /// Lookups that found their node older than the marker and promoted it.
    movement_counter: AtomicU64,
    /// Inserts arriving while a partial tier is being constructed.
    eviction_counter: AtomicU64,

    curve: Mutex<Vec<CurvePoint>>,
    stats: Statistics,
}

// SAFETY: node pointers are dereferenced only while the index guard pins
// the entry or under the list mutex; the fast table's teardown is gated by
// its RwLock write guard.
unsafe impl<V: Send> Send for FrozenHotCache<V> {}
unsafe impl<V: Send + Sync> Sync for FrozenHotCache<V> {}

impl<V: Clone> FrozenHotCache<V> {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            usage: AtomicU64::new(0),
            index: RwLock::new(HashMap::new()),
            lists: Mutex::new(Lists {
                main: List::new(),
                fast: List::new(),
                marker: std::ptr::null_mut(),
            }),
            fast: RwLock::new(FastTable::with_capacity(capacity)),
            fast_cache_ready: AtomicBool::new(false),
            frozen_all: AtomicBool::new(false),
            fast_cache_construct: AtomicBool::new(false),
            enable_insert: AtomicBool::new(true),
            curve_flag: AtomicBool::new(false),
            marker_time: AtomicU64::new(0),
            movement_counter: AtomicU64::new(0),
            eviction_counter: AtomicU64::new(0),
            curve: Mutex::new(Vec::new()),
            stats: Statistics::new(),
        }
    }

    /// Evict one entry from the dynamic tier's tail. Requires the caller to
    /// hold the index write guard. Tomb nodes found at the tail are
    /// reclaimed in passing; the curve marker is skipped over.
    fn evict_locked(&self, map: &mut HashMap<u64, IndexEntry<V>>) -> bool {
        let node = {
            let mut lists = self.lists.lock();
            let mut node = lists.main.back();
            loop {
                if lists.main.is_sentinel(node) {
                    return false;
                }
                // SAFETY: `node` is linked in the main list, which the
                // mutex protects.
                let key = unsafe { (*node).key };
                if key == TOMB_KEY {
                    let prev = unsafe { (*node).prev };
                    unsafe {
                        lists.main.detach(node);
                        Node::free(node);
                    }
                    node = prev;
                    continue;
                }
                if key == MARKER_KEY {
                    node = unsafe { (*node).prev };
                    continue;
                }
                break;
            }
            unsafe { lists.main.detach(node) };
            node
        };
        // SAFETY: detached above; freed exactly once below.
        let key = unsafe { (*node).key };
        let found = map.remove(&key).is_some();
        if !found {
            tracing::warn!(key, "frozenhot: evicted key presumably unreachable");
        }
        unsafe { Node::free(node) };
        found
    }

    /// Walk the fast chain starting at `node`, inserting live entries into
    /// the fast table until `limit` entries are placed (0 = no limit) or an
    /// exhaustion probe trips. Dead and tomb nodes are unlinked and freed.
    ///
    /// Returns `(inserted, dead, resume, exhausted)` where `resume` is the
    /// first unwalked node (the fast tail sentinel when the chain was
    /// consumed).
    fn freeze_walk(
        &self,
        table: &FastTable<V>,
        limit: u64,
        dc_budget: u64,
    ) -> (u64, u64, *mut Node, bool) {
        let (mut node, fast_tail) = {
            let lists = self.lists.lock();
            (lists.fast.first(), lists.fast.tail_sentinel())
        };
        let mut inserted = 0u64;
        let mut dead = 0u64;
        let mut exhausted = false;
        while node != fast_tail {
            // SAFETY: the fast chain's structure belongs to the
            // constructing thread; other threads only touch the main list.
            let next = unsafe { (*node).next };
            let key = unsafe { (*node).key };
            if key == TOMB_KEY {
                let mut lists = self.lists.lock();
                unsafe {
                    lists.fast.detach(node);
                    Node::free(node);
                }
                node = next;
                continue;
            }
            let value = {
                let map = self.index.read();
                map.get(&key).map(|entry| entry.value.clone())
            };
            let Some(value) = value else {
                dead += 1;
                let mut lists = self.lists.lock();
                unsafe {
                    if Node::is_in_list(node) {
                        lists.fast.detach(node);
                    }
                    Node::free(node);
                }
                node = next;
                continue;
            };
            table.insert(key, value);
            inserted += 1;
            node = next;
            if !exhausted
                && dc_budget > 0
                && self.eviction_counter.load(Ordering::Relaxed) >= dc_budget
            {
                // The dynamic tier's budget is gone; absorb the rest
                // regardless of the requested size.
                exhausted = true;
            }
            if !exhausted && limit > 0 && inserted >= limit {
                break;
            }
        }
        (inserted, dead, node, exhausted)
    }
}

impl<V: Clone + Send + Sync> CachePolicy<V> for FrozenHotCache<V> {
    fn lookup(&self, key: u64) -> Option<V> {
        let stat_yes = self.stats.sample();

        if self.fast_cache_ready.load(Ordering::Acquire) || self.frozen_all.load(Ordering::Acquire)
        {
            if let Some(value) = self.fast.read().find(key) {
                if stat_yes {
                    self.stats.record(Ticker::FastCacheHit);
                }
                return Some(value);
            }
            if self.frozen_all.load(Ordering::Acquire) {
                if stat_yes {
                    self.stats.record(Ticker::CacheMiss);
                }
                return None;
            }
        }

        let map = self.index.read();
        let Some(entry) = map.get(&key) else {
            if stat_yes {
                self.stats.record(Ticker::CacheMiss);
            }
            return None;
        };
        let value = entry.value.clone();
        let node = entry.node;

        if !self.fast_cache_construct.load(Ordering::Acquire) {
            if self.curve_flag.load(Ordering::Acquire) {
                // SAFETY: the index read guard pins the entry, keeping the
                // node alive; the stamp is atomic.
                let last = unsafe { (*node).last_access.load(Ordering::Relaxed) };
                if last <= self.marker_time.load(Ordering::Relaxed) {
                    // Older than the marker: this access would have missed
                    // a fast tier of the current marker position.
                    if stat_yes {
                        self.stats.record(Ticker::CacheHit);
                    }
                    self.movement_counter.fetch_add(1, Ordering::Relaxed);
                    unsafe {
                        (*node)
                            .last_access
                            .store(clock::now_micros(), Ordering::Relaxed)
                    };
                    let mut lists = self.lists.lock();
                    if self.curve_flag.load(Ordering::Relaxed) {
                        // SAFETY: under the list mutex, with the marker
                        // still installed.
                        unsafe {
                            if Node::is_in_list(node) {
                                lists.main.detach(node);
                                lists.main.push_front(node);
                            }
                        }
                    }
                } else if stat_yes {
                    self.stats.record(Ticker::FastCacheHit);
                }
                return Some(value);
            }

            if let Some(mut lists) = self.lists.try_lock() {
                if !self.fast_cache_construct.load(Ordering::Relaxed) {
                    // SAFETY: pinned by the index guard; the marker check
                    // skips nodes mid-eviction.
                    unsafe {
                        if Node::is_in_list(node) {
                            lists.main.detach(node);
                            lists.main.push_front(node);
                        }
                    }
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
        if !self.enable_insert.load(Ordering::Acquire) {
            return false;
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

        if self.fast_cache_construct.load(Ordering::Acquire) {
            self.eviction_counter.fetch_add(1, Ordering::Relaxed);
        }

        let s = self.usage.load(Ordering::Relaxed);
        let mut done = false;
        if s >= self.capacity {
            done = self.evict_locked(&mut map);
        }

        {
            let mut lists = self.lists.lock();
            if !self.enable_insert.load(Ordering::Acquire) {
                // Construction flipped to frozen-all while we were in
                // flight; undo the index insert.
                drop(lists);
                map.remove(&key);
                // SAFETY: never linked.
                unsafe { Node::free(node) };
                return false;
            }
            if self.curve_flag.load(Ordering::Relaxed) {
                // New entries during profiling sit just below the marker so
                // they are not counted as "older".
                unsafe {
                    (*node)
                        .last_access
                        .store(self.marker_time.load(Ordering::Relaxed), Ordering::Relaxed)
                };
                let marker = lists.marker;
                // SAFETY: curve_flag is only true while the marker is
                // installed, both guarded by this mutex.
                unsafe { lists.main.push_after(marker, node) };
            } else {
                // SAFETY: freshly allocated, not yet linked.
                unsafe { lists.main.push_front(node) };
            }
        }
        drop(map);

        let mut s = s;
        if !done {
            s = self.usage.fetch_add(1, Ordering::Relaxed);
        }
        if s > self.capacity {
            let mut map = self.index.write();
            if self.evict_locked(&mut map) {
                self.usage.fetch_sub(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Erasure is permitted only in the Dynamic states; while a fast tier
    /// exists (or is being built) the request is refused.
    fn erase(&self, key: u64) -> bool {
        if self.fast_cache_ready.load(Ordering::Acquire)
            || self.frozen_all.load(Ordering::Acquire)
            || self.fast_cache_construct.load(Ordering::Acquire)
        {
            return false;
        }
        let mut map = self.index.write();
        let Some(entry) = map.remove(&key) else {
            return false;
        };
        let node = entry.node;
        {
            let mut lists = self.lists.lock();
            // SAFETY: node is live; skip detach if eviction raced us.
            unsafe {
                if Node::is_in_list(node) {
                    lists.main.detach(node);
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

    /// Freeze the entire shard: every live entry goes into the fast table
    /// and inserts stay disabled until [`delete_fast_cache`].
    ///
    /// [`delete_fast_cache`]: CachePolicy::delete_fast_cache
    fn construct_tier(&self) -> bool {
        if self
            .fast_cache_construct
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.fast_cache_ready.load(Ordering::Acquire) || self.frozen_all.load(Ordering::Acquire)
        {
            self.fast_cache_construct.store(false, Ordering::Release);
            return false;
        }
        self.enable_insert.store(false, Ordering::Release);
        {
            let mut lists = self.lists.lock();
            // SAFETY: the chain is re-linked into the fast list wholesale.
            unsafe {
                if let Some((first, last)) = lists.main.take_chain() {
                    lists.fast.push_chain_front(first, last);
                }
            }
        }
        let (inserted, dead, _, _) = {
            let table = self.fast.read();
            self.freeze_walk(&table, 0, 0)
        };
        self.frozen_all.store(true, Ordering::Release);
        self.fast_cache_ready.store(true, Ordering::Release);
        self.fast_cache_construct.store(false, Ordering::Release);
        tracing::info!(
            inserted,
            dead,
            usage = self.usage.load(Ordering::Relaxed),
            "tier frozen"
        );
        true
    }

    /// Freeze the hottest `ratio` of capacity. Inserts remain enabled; if
    /// concurrent inserts exhaust the dynamic tier's budget first, the
    /// construction degrades to frozen-all.
    fn construct_fast_cache(&self, ratio: f64) -> bool {
        let ratio = ratio.clamp(0.0, 1.0);
        if self
            .fast_cache_construct
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.fast_cache_ready.load(Ordering::Acquire) || self.frozen_all.load(Ordering::Acquire)
        {
            self.fast_cache_construct.store(false, Ordering::Release);
            return false;
        }
        self.eviction_counter.store(0, Ordering::Relaxed);

        let fc_size = (ratio * self.capacity as f64) as u64;
        let dc_size = self.capacity.saturating_sub(fc_size);
        if fc_size == 0 {
            self.fast_cache_ready.store(true, Ordering::Release);
            self.fast_cache_construct.store(false, Ordering::Release);
            return true;
        }

        {
            let mut lists = self.lists.lock();
            // SAFETY: whole-chain splice under the mutex.
            unsafe {
                if let Some((first, last)) = lists.main.take_chain() {
                    lists.fast.push_chain_front(first, last);
                }
            }
        }

        let (inserted, dead, exhausted) = {
            let table = self.fast.read();
            let (inserted, dead, resume, exhausted) = self.freeze_walk(&table, fc_size, dc_size);
            // Splice the unwalked remainder back as the (older end of the)
            // dynamic tier. Inserts that arrived during the walk are newer
            // and already sit at the main head.
            let mut lists = self.lists.lock();
            if resume != lists.fast.tail_sentinel() {
                let chain_first = resume;
                let chain_last = lists.fast.back();
                let fast_tail = lists.fast.tail_sentinel();
                // SAFETY: `resume` and everything after it are linked in
                // the fast list; close the fast list before the remainder
                // and hand the chain to the main list.
                unsafe {
                    let before = (*chain_first).prev;
                    (*before).next = fast_tail;
                    (*fast_tail).prev = before;
                    lists.main.push_chain_back(chain_first, chain_last);
                }
            }
            (inserted, dead, exhausted)
        };

        if exhausted {
            self.enable_insert.store(false, Ordering::Release);
            self.frozen_all.store(true, Ordering::Release);
        }
        self.fast_cache_ready.store(true, Ordering::Release);
        self.fast_cache_construct.store(false, Ordering::Release);
        self.eviction_counter.store(0, Ordering::Relaxed);
        tracing::info!(
            inserted,
            dead,
            exhausted,
            usage = self.usage.load(Ordering::Relaxed),
            fc_size,
            "fast cache constructed"
        );
        true
    }

    /// Splice the frozen nodes back into the dynamic LRU at the head,
    /// restore the Dynamic state, and clear the fast table once in-flight
    /// readers have drained.
    fn delete_fast_cache(&self) {
        {
            let mut lists = self.lists.lock();
            // SAFETY: whole-chain splice under the mutex.
            unsafe {
                if let Some((first, last)) = lists.fast.take_chain() {
                    lists.main.push_chain_front(first, last);
                }
            }
            self.fast_cache_ready.store(false, Ordering::Release);
            self.frozen_all.store(false, Ordering::Release);
            self.enable_insert.store(true, Ordering::Release);
        }
        // The write guard waits out readers that saw the tier as ready.
        self.fast.write().clear();
    }

    /// Profile the hit-ratio-versus-size curve by pushing a marker at the
    /// head and counting accesses to nodes older than it.
    fn get_curve(&self, should_stop: &AtomicBool) -> bool {
        if !self.enable_insert.load(Ordering::Acquire) {
            return false;
        }
        let was_sampled = self.stats.is_sampled();
        self.stats.set_sampled(false);

        let marker = Node::alloc(MARKER_KEY);
        // SAFETY: freshly allocated.
        let stamp = unsafe { (*marker).last_access.load(Ordering::Relaxed) };
        self.marker_time.store(stamp, Ordering::Relaxed);
        {
            let mut lists = self.lists.lock();
            // SAFETY: marker is detached; installed under the mutex.
            unsafe { lists.main.push_front(marker) };
            lists.marker = marker;
            self.curve_flag.store(true, Ordering::Release);
            self.stats.reset_cursor();
        }

        for i in 0..CURVE_MAX_POINTS {
            if should_stop.load(Ordering::Relaxed) {
                break;
            }
            let target = self.capacity as f64 * i as f64 / 100.0 * 2.0;
            let mut fc_size;
            loop {
                std::thread::sleep(CURVE_POLL);
                let probe = self.stats.step();
                fc_size = self.movement_counter.load(Ordering::Relaxed);
                if probe.fast_hit_ratio + probe.miss_ratio > CURVE_SATURATION {
                    break;
                }
                if fc_size as f64 > target || should_stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            let size_ratio = fc_size as f64 / self.capacity as f64;
            let step = self.stats.step_and_advance();
            tracing::debug!(
                pass = i,
                fc_size,
                size_ratio,
                fc_hit = step.fast_hit_ratio,
                miss = step.miss_ratio,
                "curve pass"
            );
            if step.fast_hit_ratio + step.miss_ratio > CURVE_SATURATION
                || step.fast_hit_ratio > CURVE_FC_HIT_CEILING
            {
                break;
            }
            self.curve.lock().push(CurvePoint {
                size: size_ratio,
                fc_hit: step.fast_hit_ratio,
                miss: step.miss_ratio,
            });
        }

        {
            let mut lists = self.lists.lock();
            self.curve_flag.store(false, Ordering::Release);
            let marker = lists.marker;
            lists.marker = std::ptr::null_mut();
            // SAFETY: the marker was installed by us; eviction skips it, so
            // it is either still linked or was never detached.
            unsafe {
                if Node::is_in_list(marker) {
                    lists.main.detach(marker);
                }
                Node::free(marker);
            }
        }
        self.stats.set_sampled(was_sampled);
        self.movement_counter.store(0, Ordering::Relaxed);
        true
    }

    fn take_curve(&self) -> Vec<CurvePoint> {
        std::mem::take(&mut self.curve.lock())
    }

    fn fast_tier_ready(&self) -> bool {
        self.fast_cache_ready.load(Ordering::Acquire) || self.frozen_all.load(Ordering::Acquire)
    }

    fn print_status(&self) {
        tracing::info!(
            usage = self.usage.load(Ordering::Relaxed),
            fast_entries = self.fast.read().len(),
            ready = self.fast_cache_ready.load(Ordering::Relaxed),
            frozen_all = self.frozen_all.load(Ordering::Relaxed),
            "frozenhot status"
        );
    }
}
