//! The per-shard policy contract.
//!
//! Every shard implements [`CachePolicy`]. The required operations are the
//! universal cache surface; the fast-tier hooks and curve profiling are
//! optional capabilities that only the FrozenHot policy provides: the
//! defaults report "not supported" the way the contract prescribes.

use std::sync::atomic::AtomicBool;

use crate::stats::Statistics;

/// One sampled point of the hit-ratio-versus-fast-tier-size curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    /// Fast-tier size as a fraction of shard capacity.
    pub size: f64,
    /// Fraction of the step window the fast tier would have served.
    pub fc_hit: f64,
    /// Miss fraction of the step window.
    pub miss: f64,
}

/// Contract implemented by every shard policy.
///
/// `lookup`/`insert`/`erase` never fail: a well-formed operation always runs
/// to completion and reports its outcome in the return value.
pub trait CachePolicy<V>: Send + Sync {
    /// Find `key`, returning a clone of its value and applying the policy's
    /// promotion rule.
    fn lookup(&self, key: u64) -> Option<V>;

    /// Insert or update `key`. Returns `true` for a fresh insert, `false`
    /// for an in-place update of an existing key or a rejection (FrozenHot
    /// rejects inserts only while frozen-all, including a freeze-all
    /// construction; inserts stay enabled during partial construction).
    fn insert(&self, key: u64, value: V) -> bool;

    /// Remove `key`. Returns whether an entry was removed.
    fn erase(&self, key: u64) -> bool;

    /// Current usage (sum of entry charges).
    fn size(&self) -> u64;

    /// Whether usage has reached capacity.
    fn is_full(&self) -> bool;

    /// This shard's ticker block.
    fn stats(&self) -> &Statistics;

    /// Freeze the entire shard into the fast tier. Not supported by default.
    fn construct_tier(&self) -> bool {
        false
    }

    /// Freeze the hottest `ratio` of capacity into the fast tier. Not
    /// supported by default.
    fn construct_fast_cache(&self, _ratio: f64) -> bool {
        false
    }

    /// Tear down the fast tier and restore the dynamic cache.
    fn delete_fast_cache(&self) {}

    /// Profile the hit-ratio-versus-size curve. Not supported by default.
    fn get_curve(&self, _should_stop: &AtomicBool) -> bool {
        false
    }

    /// Take the points recorded by the last [`get_curve`](Self::get_curve).
    fn take_curve(&self) -> Vec<CurvePoint> {
        Vec::new()
    }

    /// Whether a frozen fast tier is currently serving lookups.
    fn fast_tier_ready(&self) -> bool {
        false
    }

    /// Log a one-shot status report.
    fn print_status(&self) {}
}
