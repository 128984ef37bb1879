//! Segment (slot-log) shard policy.
//!
//! Classical LRU mutates a linked list on every hit, which makes the list
//! mutex the bottleneck under concurrent lookups. This policy replaces
//! per-access list mutation with a per-access *append*: the log is a chain
//! of fixed-size segments, the head segment takes appends with a single
//! `fetch_add` on its slot cursor, and eviction removes the tail segment
//! wholesale.
//!
//! Each entry carries a monotonically increasing version; each slot records
//! the version it was appended with. Exactly one slot (the most recent)
//! matches the entry's current version; all older slots are stale and are
//! garbage-collected when their segment is evicted.
//!
//! Ownership: the index holds one reference to each entry and every
//! published slot holds another (an `Arc` each). An entry's charge stays in
//! `usage` until the last reference drops, so stale slots keep an erased
//! entry charged until the log catches up: the same accounting the refcount
//! scheme this replaces had.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::SegmentConfig;
use crate::policy::CachePolicy;
use crate::stats::{Statistics, Ticker};

/// Spins granted to an appender that has claimed a slot but not yet
/// published it before the evictor gives up on the slot.
const UNPUBLISHED_SLOT_SPINS: u32 = 128;

struct SegEntry<V> {
    key: u64,
    value: RwLock<V>,
    version: AtomicU32,
    /// Head segment at insert time. Compared by address only, never
    /// dereferenced: a stale pointer at worst skips one promotion.
    belong: AtomicPtr<Segment<V>>,
    charge: u64,
    usage: Arc<AtomicU64>,
}

impl<V> SegEntry<V> {
    fn new(
        key: u64,
        value: V,
        belong: *mut Segment<V>,
        usage: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let charge = 1;
        usage.fetch_add(charge, Ordering::Relaxed);
        Arc::new(Self {
            key,
            value: RwLock::new(value),
            version: AtomicU32::new(1),
            belong: AtomicPtr::new(belong),
            charge,
            usage,
        })
    }
}

impl<V> Drop for SegEntry<V> {
    fn drop(&mut self) {
        self.usage.fetch_sub(self.charge, Ordering::Relaxed);
    }
}

struct Slot<V> {
    entry: AtomicPtr<SegEntry<V>>,
    version: AtomicU32,
}

struct Segment<V> {
    slots: Box<[Slot<V>]>,
    used: AtomicU32,
    /// Toward the head (newer segment).
    prev: AtomicPtr<Segment<V>>,
    /// Toward the tail (older segment).
    next: AtomicPtr<Segment<V>>,
}

impl<V> Segment<V> {
    fn alloc(slot_count: u32) -> *mut Segment<V> {
        let slots: Vec<Slot<V>> = (0..slot_count)
            .map(|_| Slot {
                entry: AtomicPtr::new(ptr::null_mut()),
                version: AtomicU32::new(0),
            })
            .collect();
        Box::into_raw(Box::new(Segment {
            slots: slots.into_boxed_slice(),
            used: AtomicU32::new(0),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Claim a slot and publish `(entry, version)` into it. Fails when the
    /// segment is full; the claim itself is a single `fetch_add`.
    fn append(&self, entry: &Arc<SegEntry<V>>, version: u32) -> bool {
        let slot_id = self.used.fetch_add(1, Ordering::Relaxed) as usize;
        if slot_id < self.slots.len() {
            let slot = &self.slots[slot_id];
            slot.version.store(version, Ordering::Relaxed);
            // The Release store publishes the version write above; the slot
            // reference is accounted to the entry via the raw Arc.
            slot.entry
                .store(Arc::into_raw(Arc::clone(entry)) as *mut _, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn is_full(&self) -> bool {
        self.used.load(Ordering::Relaxed) as usize >= self.slots.len()
    }
}

/// Log of segments. The head takes appends; the tail is evicted whole.
/// Head and tail each have a dedicated mutex; the atomic pointers let the
/// append fast path observe the current head without locking.
struct SegmentList<V> {
    head: AtomicPtr<Segment<V>>,
    tail: AtomicPtr<Segment<V>>,
    count: AtomicU64,
    head_mtx: Mutex<()>,
    tail_mtx: Mutex<()>,
    /// Appends currently holding a segment pointer. Eviction quiesces this
    /// to zero after detaching the tail, so a stalled appender can never
    /// observe a freed segment.
    active_appends: AtomicU64,
    slots_per_segment: u32,
    min_segments: u64,
}

impl<V> SegmentList<V> {
    fn new(config: SegmentConfig) -> Self {
        let slots_per_segment = config.slots_per_segment.max(1);
        let first = Segment::<V>::alloc(slots_per_segment);
        Self {
            head: AtomicPtr::new(first),
            tail: AtomicPtr::new(first),
            count: AtomicU64::new(1),
            head_mtx: Mutex::new(()),
            tail_mtx: Mutex::new(()),
            active_appends: AtomicU64::new(0),
            slots_per_segment,
            min_segments: config.min_segments.max(1),
        }
    }

    #[inline]
    fn head_ptr(&self) -> *mut Segment<V> {
        self.head.load(Ordering::Acquire)
    }

    fn segment_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Append a slot for `entry`, allocating and splicing a fresh head
    /// segment when the current one fills.
    fn add(&self, entry: &Arc<SegEntry<V>>, version: u32) {
        // Registered before the head pointer is read; eviction waits for
        // this to drain before freeing a detached segment.
        self.active_appends.fetch_add(1, Ordering::Acquire);
        loop {
            let head = self.head_ptr();
            // SAFETY: the head was read while registered in
            // `active_appends`, so eviction cannot free it underneath us.
            if unsafe { (*head).append(entry, version) } {
                break;
            }
            let _guard = self.head_mtx.lock();
            let current = self.head_ptr();
            // SAFETY: as above; re-check under the mutex so only one
            // allocator splices.
            if unsafe { (*current).is_full() } {
                let fresh = Segment::<V>::alloc(self.slots_per_segment);
                // SAFETY: `fresh` is unshared; `current` stays valid under
                // the head mutex.
                unsafe {
                    (*fresh).next.store(current, Ordering::Relaxed);
                    (*current).prev.store(fresh, Ordering::Relaxed);
                }
                self.head.store(fresh, Ordering::Release);
                self.count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.active_appends.fetch_sub(1, Ordering::Release);
    }

    /// Detach the tail segment, refusing to shrink the log below the
    /// minimum-segments floor. Waits for registered appenders to drain so
    /// the detached segment is unreachable on return.
    fn evict(&self) -> Option<*mut Segment<V>> {
        let _guard = self.tail_mtx.lock();
        if self.count.load(Ordering::Relaxed) <= self.min_segments {
            return None;
        }
        let victim = self.tail.load(Ordering::Acquire);
        // SAFETY: count > min_segments >= 1 guarantees a newer segment
        // exists, so `prev` is non-null; both pointers stay valid under the
        // tail mutex.
        let new_tail = unsafe { (*victim).prev.load(Ordering::Relaxed) };
        debug_assert!(!new_tail.is_null());
        unsafe { (*new_tail).next.store(ptr::null_mut(), Ordering::Relaxed) };
        self.tail.store(new_tail, Ordering::Release);
        self.count.fetch_sub(1, Ordering::Relaxed);
        // Appenders register before reading the head pointer, so once the
        // count drains, nobody can still hold `victim` and every claimed
        // slot below `used` is published.
        while self.active_appends.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        Some(victim)
    }
}

impl<V> Drop for SegmentList<V> {
    fn drop(&mut self) {
        // Exclusive at drop: walk head -> tail, releasing every published
        // slot reference and freeing the segment boxes.
        let mut seg = self.head.load(Ordering::Relaxed);
        while !seg.is_null() {
            // SAFETY: segments between head and tail are live and owned by
            // the list.
            let next = unsafe { (*seg).next.load(Ordering::Relaxed) };
            unsafe {
                let used = ((*seg).used.load(Ordering::Relaxed) as usize).min((&(*seg).slots).len());
                for slot in &(&(*seg).slots)[..used] {
                    let entry = slot.entry.swap(ptr::null_mut(), Ordering::Relaxed);
                    if !entry.is_null() {
                        drop(Arc::from_raw(entry as *const SegEntry<V>));
                    }
                }
                drop(Box::from_raw(seg));
            }
            seg = next;
        }
    }
}

/// One segment-policy shard.
pub struct SegmentCache<V> {
    capacity: u64,
    usage: Arc<AtomicU64>,
    index: RwLock<HashMap<u64, Arc<SegEntry<V>>>>,
    log: SegmentList<V>,
    stats: Statistics,
}

impl<V: Clone> SegmentCache<V> {
    pub fn new(capacity: u64, config: SegmentConfig) -> Self {
        Self {
            capacity,
            usage: Arc::new(AtomicU64::new(0)),
            index: RwLock::new(HashMap::new()),
            log: SegmentList::new(config),
            stats: Statistics::new(),
        }
    }

    /// Evict the tail segment: release every slot, and for each *live* slot
    /// also release the index entry. Returns false when the log is at its
    /// minimum-segments floor.
    fn evict_one(&self) -> bool {
        let Some(seg) = self.log.evict() else {
            return false;
        };
        // SAFETY: the segment was detached above; only this thread reaches
        // it now.
        let seg_ref = unsafe { &*seg };
        let used = (seg_ref.used.load(Ordering::Relaxed) as usize).min(seg_ref.slots.len());
        for slot in &seg_ref.slots[..used] {
            let mut raw = slot.entry.swap(ptr::null_mut(), Ordering::Acquire);
            if raw.is_null() {
                // Claimed but not yet published; give the appender a moment.
                let mut spins = 0;
                while raw.is_null() && spins < UNPUBLISHED_SLOT_SPINS {
                    std::hint::spin_loop();
                    raw = slot.entry.swap(ptr::null_mut(), Ordering::Acquire);
                    spins += 1;
                }
                if raw.is_null() {
                    tracing::warn!("segment: slot claimed but never published, skipping");
                    continue;
                }
            }
            // SAFETY: the raw pointer came from Arc::into_raw in append and
            // was swapped out exactly once.
            let entry = unsafe { Arc::from_raw(raw as *const SegEntry<V>) };
            let slot_version = slot.version.load(Ordering::Relaxed);
            if entry.version.load(Ordering::Relaxed) == slot_version {
                // This is the live slot: the entry's presence in the index
                // ends with its segment, unless a promotion slipped in.
                let mut map = self.index.write();
                if let Some(indexed) = map.get(&entry.key) {
                    if Arc::ptr_eq(indexed, &entry)
                        && entry.version.load(Ordering::Relaxed) == slot_version
                    {
                        map.remove(&entry.key);
                    }
                }
            }
            // Dropping `entry` releases this slot's reference; the last
            // release returns the charge.
        }
        // SAFETY: fully drained, detached, exclusively owned.
        unsafe { drop(Box::from_raw(seg)) };
        true
    }
}

impl<V: Clone + Send + Sync> CachePolicy<V> for SegmentCache<V> {
    fn lookup(&self, key: u64) -> Option<V> {
        let stat_yes = self.stats.sample();
        let entry = {
            let map = self.index.read();
            map.get(&key).cloned()
        };
        let Some(entry) = entry else {
            if stat_yes {
                self.stats.record(Ticker::CacheMiss);
            }
            return None;
        };
        let value = entry.value.read().clone();
        if entry.belong.load(Ordering::Relaxed) != self.log.head_ptr() {
            // The head has moved on since this entry's last slot was
            // appended; reflect the access with a fresh versioned slot.
            // The race where the head changes between the two observations
            // is tolerated: at worst one promotion is skipped.
            let old_version = entry.version.fetch_add(1, Ordering::Relaxed);
            self.log.add(&entry, old_version + 1);
        }
        if stat_yes {
            self.stats.record(Ticker::CacheHit);
        }
        Some(value)
    }

    fn insert(&self, key: u64, value: V) -> bool {
        if self.stats.sample() {
            self.stats.record(Ticker::Insert);
        }

        let head = self.log.head_ptr();
        let entry = {
            let mut map = self.index.write();
            if let Some(existing) = map.get(&key) {
                *existing.value.write() = value;
                return false;
            }
            let entry = SegEntry::new(key, value, head, Arc::clone(&self.usage));
            map.insert(key, Arc::clone(&entry));
            entry
        };
        self.log.add(&entry, 1);

        while self.usage.load(Ordering::Relaxed) > self.capacity {
            if !self.evict_one() {
                break;
            }
        }
        true
    }

    fn erase(&self, key: u64) -> bool {
        // Dropping the index reference is the erase; stale slots keep the
        // entry (and its charge) alive until their segments are evicted.
        self.index.write().remove(&key).is_some()
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

    fn print_status(&self) {
        tracing::info!(
            segments = self.log.segment_count(),
            slots_per_segment = self.log.slots_per_segment,
            usage = self.usage.load(Ordering::Relaxed),
            entry_bytes = std::mem::size_of::<SegEntry<V>>(),
            "segment cache status"
        );
    }
}
