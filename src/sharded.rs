//! Sharded dispatcher.
//!
//! [`ShardedCache`] routes every request by `key % num_shards` to one of N
//! independent shards; shards share no mutable state, so dispatch is
//! wait-free relative to other shards and the dispatcher itself owns no
//! mutexes on the request path.
//!
//! The dispatcher also owns the cache-wide observability surface: the two
//! latency reservoirs the external harness feeds through
//! [`record_request`](ShardedCache::record_request), the aggregate
//! statistics probes, and the monitor thread that drives the FrozenHot
//! controller (or a plain reporting loop for the other policies).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::{CacheOptions, MonitorConfig, PolicyKind};
use crate::error::ConfigError;
use crate::fifo::FifoCache;
use crate::frozenhot::FrozenHotCache;
use crate::lru::LruCache;
use crate::monitor;
use crate::policy::CachePolicy;
use crate::reservoir::{LatencyReservoir, LatencySummary};
use crate::segment::SegmentCache;
use crate::stats::Ticker;

/// Aggregate of one step window across both latency reservoirs.
#[derive(Debug, Clone, Copy)]
pub struct StepLatency {
    /// Weighted mean over hit and other samples.
    pub avg: f64,
    /// Total samples in the window.
    pub count: usize,
    /// Mean of the hit-side samples (0 when none arrived).
    pub avg_hit: f64,
    /// Mean of the other-side samples (0 when none arrived).
    pub avg_other: f64,
    /// Fraction of the window on the other (miss) side.
    pub miss_rate: f64,
}

pub(crate) struct CacheInner<V> {
    pub(crate) shards: Vec<Arc<dyn CachePolicy<V>>>,
    pub(crate) num_shards: u32,
    pub(crate) capacity: u64,
    pub(crate) policy: PolicyKind,
    pub(crate) monitor_cfg: MonitorConfig,
    pub(crate) stop: AtomicBool,
    pub(crate) hit_latency: LatencyReservoir,
    pub(crate) other_latency: LatencyReservoir,
}

impl<V> CacheInner<V> {
    #[inline]
    pub(crate) fn shard(&self, key: u64) -> &Arc<dyn CachePolicy<V>> {
        &self.shards[(key % self.num_shards as u64) as usize]
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.shards.iter().map(|shard| shard.size()).sum()
    }

    /// Aggregate and reset the per-shard hit/miss tickers, logging and
    /// returning the global miss ratio. `None` when no operations landed
    /// since the last drain.
    pub(crate) fn drain_miss_ratio(&self) -> Option<f64> {
        let mut hits = 0u64;
        let mut misses = 0u64;
        for shard in &self.shards {
            let snap = shard.stats().drain();
            hits += snap.fast_hit + snap.hit;
            misses += snap.miss;
        }
        let total = hits + misses;
        if total == 0 {
            return None;
        }
        let ratio = misses as f64 / total as f64;
        tracing::info!(ratio, hits, misses, "total miss ratio");
        Some(ratio)
    }

    /// Like [`drain_miss_ratio`](Self::drain_miss_ratio) but split by tier:
    /// returns `(1 - fast_hit_ratio, miss_ratio)`.
    pub(crate) fn drain_frozen_stat(&self) -> (f64, f64) {
        let mut fast_hits = 0u64;
        let mut other_hits = 0u64;
        let mut misses = 0u64;
        for shard in &self.shards {
            let snap = shard.stats().drain();
            fast_hits += snap.fast_hit;
            other_hits += snap.hit;
            misses += snap.miss;
        }
        let total = fast_hits + other_hits + misses;
        if total == 0 {
            return (1.0, 1.0);
        }
        let non_fast = 1.0 - fast_hits as f64 / total as f64;
        let miss_ratio = misses as f64 / total as f64;
        tracing::info!(
            non_fast,
            miss_ratio,
            fast_hits,
            other_hits,
            misses,
            "frozen stat"
        );
        (non_fast, miss_ratio)
    }

    /// Samples accumulated in both reservoirs since their last step.
    pub(crate) fn step_size(&self) -> usize {
        self.hit_latency.step_len() + self.other_latency.step_len()
    }

    /// Close the current step window on both reservoirs and combine them.
    pub(crate) fn step_latency(&self) -> Option<StepLatency> {
        let hit = self.hit_latency.step();
        let other = self.other_latency.step();
        let hit_count = hit.map_or(0, |s| s.count);
        let other_count = other.map_or(0, |s| s.count);
        let count = hit_count + other_count;
        if count == 0 {
            return None;
        }
        let avg_hit = hit.map_or(0.0, |s| s.mean);
        let avg_other = other.map_or(0.0, |s| s.mean);
        let avg = (avg_hit * hit_count as f64 + avg_other * other_count as f64) / count as f64;
        let step = StepLatency {
            avg,
            count,
            avg_hit,
            avg_other,
            miss_rate: other_count as f64 / count as f64,
        };
        tracing::debug!(
            avg = step.avg,
            count = step.count,
            avg_hit,
            avg_other,
            miss_rate = step.miss_rate,
            "step latency"
        );
        Some(step)
    }

    /// Log full-run percentile summaries and reset both reservoirs.
    pub(crate) fn global_latency(&self) -> Option<(LatencySummary, LatencySummary)> {
        let hit = self.hit_latency.summary();
        let other = self.other_latency.summary();
        if let Some(ref summary) = hit {
            tracing::info!(
                avg = summary.avg,
                count = summary.count,
                p50 = summary.p50,
                p99 = summary.p99,
                p9999 = summary.p9999,
                "hit latency"
            );
        }
        if let Some(ref summary) = other {
            tracing::info!(
                avg = summary.avg,
                count = summary.count,
                p50 = summary.p50,
                p99 = summary.p99,
                p9999 = summary.p9999,
                "other latency"
            );
        }
        self.hit_latency.reset();
        self.other_latency.reset();
        hit.zip(other)
    }
}

/// A concurrent cache: N independent shards behind key-modulo dispatch,
/// plus one monitor thread.
pub struct ShardedCache<V> {
    inner: Arc<CacheInner<V>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Send + Sync + 'static> ShardedCache<V> {
    /// Build the shards and start the monitor.
    pub fn new(options: CacheOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let per_shard = options.capacity / options.shards as u64;
        let shards: Vec<Arc<dyn CachePolicy<V>>> = (0..options.shards)
            .map(|_| match options.policy {
                PolicyKind::Fifo => {
                    Arc::new(FifoCache::new(per_shard)) as Arc<dyn CachePolicy<V>>
                }
                PolicyKind::Lru => Arc::new(LruCache::new(per_shard)) as Arc<dyn CachePolicy<V>>,
                PolicyKind::Segment => Arc::new(SegmentCache::new(per_shard, options.segment))
                    as Arc<dyn CachePolicy<V>>,
                PolicyKind::FrozenHot => {
                    Arc::new(FrozenHotCache::new(per_shard)) as Arc<dyn CachePolicy<V>>
                }
            })
            .collect();

        let inner = Arc::new(CacheInner {
            shards,
            num_shards: options.shards,
            capacity: options.capacity,
            policy: options.policy,
            monitor_cfg: options.monitor,
            stop: AtomicBool::new(false),
            hit_latency: LatencyReservoir::new(options.sample_capacity)
                .map_err(ConfigError::Reservoir)?,
            other_latency: LatencyReservoir::new(options.sample_capacity)
                .map_err(ConfigError::Reservoir)?,
        });

        let monitor = if options.monitor.enabled {
            let for_monitor = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("hotcache-monitor".into())
                .spawn(move || monitor::run(for_monitor))
                .map_err(ConfigError::Monitor)?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            inner,
            monitor: Mutex::new(monitor),
        })
    }

    /// Find `key` in its shard.
    pub fn lookup(&self, key: u64) -> Option<V> {
        self.inner.shard(key).lookup(key)
    }

    /// Insert or update `key` in its shard. See
    /// [`CachePolicy::insert`](crate::CachePolicy::insert) for the meaning
    /// of the return value.
    pub fn insert(&self, key: u64, value: V) -> bool {
        self.inner.shard(key).insert(key, value)
    }

    /// Remove `key` from its shard.
    pub fn erase(&self, key: u64) -> bool {
        self.inner.shard(key).erase(key)
    }

    /// Total usage across shards.
    pub fn size(&self) -> u64 {
        self.inner.total_size()
    }

    /// Configured total capacity.
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Number of shards.
    pub fn num_shards(&self) -> u32 {
        self.inner.num_shards
    }

    /// Record one end-to-end request latency from the driving harness.
    /// `hit` selects the hit reservoir, otherwise the other/miss reservoir.
    pub fn record_request(&self, hit: bool, micros: f64) {
        if hit {
            self.inner.hit_latency.insert(micros);
        } else {
            self.inner.other_latency.insert(micros);
        }
    }

    /// Aggregate and reset the per-shard hit/miss tickers, logging and
    /// returning the global miss ratio for the interval since the previous
    /// probe. `None` when no operations landed in the interval.
    pub fn miss_ratio(&self) -> Option<f64> {
        self.inner.drain_miss_ratio()
    }

    /// Like [`miss_ratio`](Self::miss_ratio) but split by tier: returns
    /// `(1 - fast_hit_ratio, miss_ratio)` for the interval.
    pub fn frozen_stat(&self) -> (f64, f64) {
        self.inner.drain_frozen_stat()
    }

    /// Close the current latency step window and return its combined mean,
    /// per-side means and miss rate. `None` when the window is empty.
    pub fn step_latency(&self) -> Option<StepLatency> {
        self.inner.step_latency()
    }

    /// Switch 1-in-100 sampling of the per-shard counters on or off.
    /// Sampling keeps the tickers off the hot path of long benchmark runs;
    /// curve profiling overrides it while it runs.
    pub fn set_stat_sampling(&self, sampled: bool) {
        for shard in &self.inner.shards {
            shard.stats().set_sampled(sampled);
        }
    }

    /// Sum of one ticker across all shards, without resetting anything.
    pub fn ticker_total(&self, ticker: Ticker) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.stats().ticker(ticker))
            .sum()
    }

    /// Whether any shard currently serves lookups from a frozen fast tier.
    pub fn fast_tier_active(&self) -> bool {
        self.inner.shards.iter().any(|shard| shard.fast_tier_ready())
    }

    /// Freeze the hottest `ratio` of every shard. Only meaningful for the
    /// FrozenHot policy; other policies report `false`.
    pub fn construct_fast_cache(&self, ratio: f64) -> bool {
        let mut any = false;
        for shard in &self.inner.shards {
            any |= shard.construct_fast_cache(ratio);
        }
        any
    }

    /// Freeze every shard entirely.
    pub fn construct_tier(&self) -> bool {
        let mut any = false;
        for shard in &self.inner.shards {
            any |= shard.construct_tier();
        }
        any
    }

    /// Tear down every shard's fast tier.
    pub fn delete_fast_cache(&self) {
        for shard in &self.inner.shards {
            shard.delete_fast_cache();
        }
    }

    /// Log full-run latency summaries and reset the reservoirs.
    pub fn global_latency(&self) -> Option<(LatencySummary, LatencySummary)> {
        self.inner.global_latency()
    }

    /// Log a status report for every shard.
    pub fn print_status(&self) {
        for shard in &self.inner.shards {
            shard.print_status();
        }
    }

    /// Signal the monitor to exit and wait for it. In-flight client
    /// operations are unaffected. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<V> Drop for ShardedCache<V> {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
    }
}
