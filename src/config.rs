//! Cache configuration.
//!
//! Configuration structs follow a plain-fields style: create the struct,
//! set what you need, pass it in. [`CacheOptions::new`] fills every tunable
//! with the defaults the engine was tuned with; tests and embedders override
//! individual fields.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Which eviction policy a cache instance runs.
///
/// One policy is chosen per instance; every shard of the instance runs the
/// same policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Insert at head, evict from tail, lookups never touch the list.
    Fifo,
    /// FIFO plus move-to-head on lookup under a non-blocking try-lock.
    Lru,
    /// Slot-log approximate LRU: per-access append, whole-segment eviction.
    Segment,
    /// Two-tier cache with a frozen read-only fast tier over a dynamic LRU.
    FrozenHot,
}

impl FromStr for PolicyKind {
    type Err = ConfigError;

    /// Accepts both the short names (`fifo`) and the harness names
    /// (`fifo_cache`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" | "fifo_cache" => Ok(PolicyKind::Fifo),
            "lru" | "lru_cache" => Ok(PolicyKind::Lru),
            "segment" | "segment_cache" => Ok(PolicyKind::Segment),
            "frozenhot" | "frozenhot_cache" => Ok(PolicyKind::FrozenHot),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Tunables for the segment (slot-log) policy.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    /// Slots per log segment. Larger segments amortize head allocation but
    /// coarsen eviction granularity.
    pub slots_per_segment: u32,
    /// The log never evicts below this many segments, keeping it non-empty
    /// under churn. Clamped to at least 1.
    pub min_segments: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            slots_per_segment: 1 << 16,
            min_segments: 4,
        }
    }
}

/// Tunables for the monitor/controller.
///
/// The thresholds are the values the original controller shipped with; they
/// are tunables, not invariants. Tests shrink the intervals and step gates
/// to run the whole state machine in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Spawn the monitor thread at construction. Disable for embedders that
    /// drive tier construction themselves.
    pub enabled: bool,
    /// Poll interval while frozen.
    pub check_interval: Duration,
    /// Poll interval during warm-up / wait-stable observation.
    pub wait_stable_interval: Duration,
    /// Consecutive stable observations required to leave warm-up.
    pub wait_stable_threshold: u32,
    /// Initial post-deconstruct back-off, in seconds. Grows 8x when the
    /// workload looks unsuitable, halves after a healthy frozen run.
    pub sleep_threshold_secs: u32,
    /// Margin θ by which the fast tier must beat the baseline.
    pub fast_performance_margin: f64,
    /// Validation passes after construction before the tier is trusted.
    pub pass_threshold: u32,
    /// Initial performance-depletion credit while frozen.
    pub drop_threshold: f64,
    /// Frozen steps per construction step before a forced refresh.
    pub frozen_threshold: u64,
    /// Optimal fast-tier sizes below this abandon freezing entirely.
    pub suitability_gate: f64,
    /// Minimum miss-side latency samples before profiling reads a step.
    pub min_profile_step: usize,
    /// Minimum latency samples before construction reads its baseline.
    pub min_construct_step: usize,
    /// Minimum latency samples per frozen monitoring step.
    pub min_frozen_step: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_millis(100),
            wait_stable_interval: Duration::from_millis(500),
            wait_stable_threshold: 2,
            sleep_threshold_secs: 2,
            fast_performance_margin: 0.2,
            pass_threshold: 3,
            drop_threshold: 2.0,
            frozen_threshold: 100,
            suitability_gate: 0.05,
            min_profile_step: 5,
            min_construct_step: 100,
            min_frozen_step: 50,
        }
    }
}

/// Construction parameters for a [`ShardedCache`](crate::ShardedCache).
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Total entry capacity across all shards.
    pub capacity: u64,
    /// Number of independent shards; requests route by `key % shards`.
    pub shards: u32,
    /// Eviction policy for every shard.
    pub policy: PolicyKind,
    /// Segment-policy tunables (ignored by other policies).
    pub segment: SegmentConfig,
    /// Controller tunables.
    pub monitor: MonitorConfig,
    /// Latency reservoir capacity, in samples, per reservoir.
    pub sample_capacity: usize,
}

impl CacheOptions {
    /// Options with default tunables for the given shape.
    pub fn new(capacity: u64, shards: u32, policy: PolicyKind) -> Self {
        Self {
            capacity,
            shards,
            policy,
            segment: SegmentConfig::default(),
            monitor: MonitorConfig::default(),
            sample_capacity: 1 << 26,
        }
    }

    /// Check the shape invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        if self.capacity < self.shards as u64 {
            return Err(ConfigError::CapacityBelowShards {
                capacity: self.capacity,
                shards: self.shards,
            });
        }
        Ok(())
    }
}
