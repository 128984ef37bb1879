//! Per-shard operation statistics.
//!
//! Every shard owns one [`Statistics`] block: a small fixed array of atomic
//! tickers plus a matching set of cursors. Two read styles are supported,
//! mirroring how the controller consumes them:
//!
//! - [`Statistics::drain`] returns the tickers and resets everything. The
//!   dispatcher-level miss-ratio probes use this, so each probe reports the
//!   interval since the previous probe.
//! - [`Statistics::step`] / [`Statistics::step_and_advance`] report ratios
//!   relative to the cursors without disturbing the tickers. Curve profiling
//!   uses these to watch a window grow.
//!
//! Recording can optionally be sampled at 1-in-100 to keep the counters off
//! the hot path of large benchmark runs; curve profiling switches sampling
//! off so the step ratios stay exact.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::Rng;

/// Ticker kinds tracked per shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Ticker {
    /// Lookup served by the frozen fast tier (or counted as such during
    /// curve profiling).
    FastCacheHit = 0,
    /// Lookup served by the dynamic tier / main index.
    CacheHit = 1,
    /// Lookup that found nothing.
    CacheMiss = 2,
    /// Insert operation (used as the step-miss proxy during profiling,
    /// since in the driving workload every miss is followed by an insert).
    Insert = 3,
}

const TICKER_COUNT: usize = 4;

const SAMPLE_ONE_IN: u32 = 100;

/// Snapshot returned by [`Statistics::drain`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatSnapshot {
    /// Fast-tier hits since the last drain.
    pub fast_hit: u64,
    /// Dynamic-tier hits since the last drain.
    pub hit: u64,
    /// Misses since the last drain.
    pub miss: u64,
}

/// Cursor-relative ratios returned by [`Statistics::step`].
#[derive(Debug, Clone, Copy)]
pub struct StepRatios {
    /// Fraction of the step window served by the fast tier.
    pub fast_hit_ratio: f64,
    /// Fraction of the step window that missed (insert-proxied).
    pub miss_ratio: f64,
}

/// Atomic ticker block with step cursors.
pub struct Statistics {
    tickers: [AtomicU64; TICKER_COUNT],
    cursors: [AtomicU64; TICKER_COUNT],
    sampled: AtomicBool,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            tickers: Default::default(),
            cursors: Default::default(),
            sampled: AtomicBool::new(false),
        }
    }

    /// Decide whether this operation should be recorded.
    ///
    /// Always true unless sampling is enabled, in which case roughly 1 in
    /// 100 operations record (thread-local RNG, no locking).
    #[inline]
    pub fn sample(&self) -> bool {
        if !self.sampled.load(Ordering::Relaxed) {
            true
        } else {
            rand::thread_rng().gen_ratio(1, SAMPLE_ONE_IN)
        }
    }

    /// Enable or disable 1-in-100 sampling.
    pub fn set_sampled(&self, sampled: bool) {
        self.sampled.store(sampled, Ordering::Relaxed);
    }

    /// Whether sampling is currently enabled.
    pub fn is_sampled(&self) -> bool {
        self.sampled.load(Ordering::Relaxed)
    }

    /// Record one tick.
    #[inline]
    pub fn record(&self, ticker: Ticker) {
        self.tickers[ticker as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Non-destructive ticker read.
    pub fn ticker(&self, ticker: Ticker) -> u64 {
        self.tickers[ticker as usize].load(Ordering::Relaxed)
    }

    /// Return hit/miss counts accumulated since the previous drain and
    /// reset all tickers and cursors.
    pub fn drain(&self) -> StatSnapshot {
        let snap = StatSnapshot {
            fast_hit: self.ticker(Ticker::FastCacheHit),
            hit: self.ticker(Ticker::CacheHit),
            miss: self.ticker(Ticker::CacheMiss),
        };
        for i in 0..TICKER_COUNT {
            self.tickers[i].store(0, Ordering::Relaxed);
            self.cursors[i].store(0, Ordering::Relaxed);
        }
        snap
    }

    /// Move all cursors up to the current ticker values, so the next step
    /// window starts here.
    pub fn reset_cursor(&self) {
        for i in 0..TICKER_COUNT {
            self.cursors[i].store(self.tickers[i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    fn step_window(&self) -> (u64, u64, u64) {
        let delta = |t: Ticker| {
            self.tickers[t as usize]
                .load(Ordering::Relaxed)
                .saturating_sub(self.cursors[t as usize].load(Ordering::Relaxed))
        };
        (
            delta(Ticker::FastCacheHit),
            delta(Ticker::CacheHit),
            delta(Ticker::Insert),
        )
    }

    /// Ratios for the window since the last cursor reset. Does not advance
    /// the cursors. An empty window reports a full miss.
    pub fn step(&self) -> StepRatios {
        let (fast, hit, insert) = self.step_window();
        let total = fast + hit + insert;
        if total == 0 {
            StepRatios {
                fast_hit_ratio: 0.0,
                miss_ratio: 1.0,
            }
        } else {
            StepRatios {
                fast_hit_ratio: fast as f64 / total as f64,
                miss_ratio: insert as f64 / total as f64,
            }
        }
    }

    /// Like [`step`](Self::step) but also advances the cursors, closing the
    /// window.
    pub fn step_and_advance(&self) -> StepRatios {
        let ratios = self.step();
        self.reset_cursor();
        ratios
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read() {
        let stats = Statistics::new();
        stats.record(Ticker::CacheHit);
        stats.record(Ticker::CacheHit);
        stats.record(Ticker::CacheMiss);
        assert_eq!(stats.ticker(Ticker::CacheHit), 2);
        assert_eq!(stats.ticker(Ticker::CacheMiss), 1);
        assert_eq!(stats.ticker(Ticker::FastCacheHit), 0);
    }

    #[test]
    fn test_drain_resets() {
        let stats = Statistics::new();
        stats.record(Ticker::CacheHit);
        stats.record(Ticker::CacheMiss);
        let snap = stats.drain();
        assert_eq!(snap.hit, 1);
        assert_eq!(snap.miss, 1);
        assert_eq!(stats.ticker(Ticker::CacheHit), 0);
        let snap = stats.drain();
        assert_eq!(snap.hit, 0);
    }

    #[test]
    fn test_step_ratios() {
        let stats = Statistics::new();
        // Empty window reads as a full miss.
        let step = stats.step();
        assert_eq!(step.fast_hit_ratio, 0.0);
        assert_eq!(step.miss_ratio, 1.0);

        for _ in 0..8 {
            stats.record(Ticker::FastCacheHit);
        }
        stats.record(Ticker::CacheHit);
        stats.record(Ticker::Insert);
        let step = stats.step();
        assert!((step.fast_hit_ratio - 0.8).abs() < 1e-9);
        assert!((step.miss_ratio - 0.1).abs() < 1e-9);

        // Advancing closes the window.
        stats.step_and_advance();
        let step = stats.step();
        assert_eq!(step.miss_ratio, 1.0);
    }

    #[test]
    fn test_sampling_toggle() {
        let stats = Statistics::new();
        assert!(stats.sample());
        stats.set_sampled(true);
        assert!(stats.is_sampled());
        // Sampled mode records roughly 1 in 100; over many trials at least
        // one record and at least one skip are overwhelmingly likely.
        let decisions: Vec<bool> = (0..10_000).map(|_| stats.sample()).collect();
        assert!(decisions.iter().any(|d| *d));
        assert!(decisions.iter().any(|d| !*d));
    }
}
