//! Configuration errors.
//!
//! Cache operations themselves never fail: lookups return `Option`, inserts
//! and erases report what happened with a `bool`. The only fallible surface
//! is configuration and construction.

use thiserror::Error;

/// Errors produced while validating [`CacheOptions`](crate::CacheOptions)
/// or constructing a [`ShardedCache`](crate::ShardedCache).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The policy name did not match any known cache policy.
    #[error("unknown cache policy: {0:?}")]
    UnknownPolicy(String),

    /// Total capacity must be non-zero.
    #[error("capacity must be non-zero")]
    ZeroCapacity,

    /// Shard count must be non-zero.
    #[error("shard count must be non-zero")]
    ZeroShards,

    /// Each shard must receive at least one entry of capacity.
    #[error("capacity {capacity} must be at least the shard count {shards}")]
    CapacityBelowShards {
        /// Requested total capacity.
        capacity: u64,
        /// Requested shard count.
        shards: u32,
    },

    /// The latency reservoir mapping could not be created.
    #[error("failed to map latency reservoir: {0}")]
    Reservoir(#[source] std::io::Error),

    /// The monitor thread could not be spawned.
    #[error("failed to spawn monitor thread: {0}")]
    Monitor(#[source] std::io::Error),
}
