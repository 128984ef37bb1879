//! Open-addressed hash table backing the frozen fast tier.
//!
//! The table is fixed-capacity and sized to `1 << (ceil_log2(capacity) + 1)`
//! buckets, i.e. twice the next power of two above the shard capacity, so
//! linear probing stays short even when a whole shard is frozen into it.
//!
//! Write protocol: inserts happen only while a tier is being constructed,
//! from the single constructing thread. Each bucket publishes through an
//! atomic state word (EMPTY, then BUSY, then OCCUPIED), with the key and
//! value written inside the BUSY window, so a concurrent reader either
//! observes OCCUPIED (and a fully published pair) or skips the bucket.
//!
//! Read protocol: `find` is lock-free; it stops at the first EMPTY bucket
//! (nothing is ever deleted individually, so probe chains have no holes).
//! `clear` takes `&mut self`: the owning shard keeps the table behind an
//! `RwLock` whose write guard drains in-flight readers before teardown.

use std::cell::UnsafeCell;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const OCCUPIED: u8 = 2;

struct Bucket<V> {
    state: AtomicU8,
    key: AtomicU64,
    value: UnsafeCell<Option<V>>,
}

/// Fixed-capacity concurrent open-addressed table.
pub struct FastTable<V> {
    buckets: Box<[Bucket<V>]>,
    mask: usize,
    len: AtomicUsize,
    hasher: ahash::RandomState,
}

// SAFETY: the value cell of a bucket is written only inside the BUSY window
// by the single constructing thread and read only when the state word is
// OCCUPIED (published with Release ordering); `clear` requires `&mut self`.
unsafe impl<V: Send> Send for FastTable<V> {}
unsafe impl<V: Send + Sync> Sync for FastTable<V> {}

impl<V: Clone> FastTable<V> {
    /// A table able to hold `capacity` entries with short probes.
    pub fn with_capacity(capacity: u64) -> Self {
        let size = (capacity.max(1).next_power_of_two() as usize) << 1;
        let buckets: Vec<Bucket<V>> = (0..size)
            .map(|_| Bucket {
                state: AtomicU8::new(EMPTY),
                key: AtomicU64::new(0),
                value: UnsafeCell::new(None),
            })
            .collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: size - 1,
            len: AtomicUsize::new(0),
            hasher: ahash::RandomState::new(),
        }
    }

    #[inline]
    fn bucket_index(&self, key: u64) -> usize {
        self.hasher.hash_one(key) as usize & self.mask
    }

    /// Number of occupied buckets.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish `(key, value)`. Single-writer: only the constructing thread
    /// calls this. Returns false when the table is full.
    pub fn insert(&self, key: u64, value: V) -> bool {
        let mut index = self.bucket_index(key);
        for _ in 0..self.buckets.len() {
            let bucket = &self.buckets[index];
            match bucket.state.load(Ordering::Acquire) {
                OCCUPIED if bucket.key.load(Ordering::Relaxed) == key => {
                    bucket.state.store(BUSY, Ordering::Release);
                    // SAFETY: single writer; readers skip BUSY buckets.
                    unsafe { *bucket.value.get() = Some(value) };
                    bucket.state.store(OCCUPIED, Ordering::Release);
                    return true;
                }
                EMPTY => {
                    if bucket
                        .state
                        .compare_exchange(EMPTY, BUSY, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        bucket.key.store(key, Ordering::Relaxed);
                        // SAFETY: this thread owns the BUSY window.
                        unsafe { *bucket.value.get() = Some(value) };
                        bucket.state.store(OCCUPIED, Ordering::Release);
                        self.len.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                }
                _ => {}
            }
            index = (index + 1) & self.mask;
        }
        false
    }

    /// Lock-free probe.
    pub fn find(&self, key: u64) -> Option<V> {
        let mut index = self.bucket_index(key);
        for _ in 0..self.buckets.len() {
            let bucket = &self.buckets[index];
            match bucket.state.load(Ordering::Acquire) {
                EMPTY => return None,
                OCCUPIED if bucket.key.load(Ordering::Relaxed) == key => {
                    // SAFETY: OCCUPIED was published with Release after the
                    // value write, and no writer runs while readers probe.
                    return unsafe { (*bucket.value.get()).clone() };
                }
                _ => {}
            }
            index = (index + 1) & self.mask;
        }
        None
    }

    /// Drop every entry. Exclusive access is required, which the owning
    /// shard arranges by holding its table write lock.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter() {
            bucket.state.store(EMPTY, Ordering::Relaxed);
            bucket.key.store(0, Ordering::Relaxed);
            // SAFETY: `&mut self`: no concurrent access.
            unsafe { *bucket.value.get() = None };
        }
        self.len.store(0, Ordering::Relaxed);
    }
}
