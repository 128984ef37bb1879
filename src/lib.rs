//! # hotcache
//!
//! A concurrent in-memory key-value cache engine that experiments with
//! several eviction policies behind one sharded facade:
//!
//! | Policy | Ordering structure | Lookup cost |
//! |--------|--------------------|-------------|
//! | [`PolicyKind::Fifo`] | intrusive list, insert-order | index read only |
//! | [`PolicyKind::Lru`] | intrusive list, move-to-head | index read + try-lock promote |
//! | [`PolicyKind::Segment`] | slotted append-only log | index read + atomic append |
//! | [`PolicyKind::FrozenHot`] | dynamic LRU + frozen hash tier | fast-tier probe on the hot path |
//!
//! A [`ShardedCache`] routes each request by `key % num_shards` to one of N
//! independent shards; shards share no mutable state. Keys are `u64`,
//! values are any cloneable payload: use `Arc<T>` for shared ownership
//! semantics.
//!
//! The FrozenHot policy splits each shard into a frozen, read-optimized
//! fast tier (a concurrent open-addressed hash table with no list
//! maintenance) and a dynamic LRU tier. A monitor thread observes latency
//! and miss ratio, profiles a hit-ratio-versus-tier-size curve, and decides
//! when to freeze, how much, and when the frozen snapshot has gone stale.
//!
//! ## Example
//!
//! ```
//! use hotcache::{CacheOptions, PolicyKind, ShardedCache};
//!
//! let mut options = CacheOptions::new(1024, 4, PolicyKind::Lru);
//! options.monitor.enabled = false; // drive the cache without a monitor
//! options.sample_capacity = 1 << 12;
//!
//! let cache: ShardedCache<u64> = ShardedCache::new(options).unwrap();
//! cache.insert(7, 42);
//! assert_eq!(cache.lookup(7), Some(42));
//! cache.erase(7);
//! assert_eq!(cache.lookup(7), None);
//! ```
//!
//! ## Reserved keys
//!
//! The FrozenHot policy reserves keys `0`, `1` and `2` for its null, tomb
//! and marker sentinels; real keys must avoid them when that policy is in
//! use. The other policies accept any `u64`.

mod clock;
mod fast_hash;
mod list;
mod monitor;

pub mod config;
pub mod error;
pub mod fifo;
pub mod frozenhot;
pub mod lru;
pub mod policy;
pub mod reservoir;
pub mod segment;
pub mod sharded;
pub mod stats;

pub use config::{CacheOptions, MonitorConfig, PolicyKind, SegmentConfig};
pub use error::ConfigError;
pub use fifo::FifoCache;
pub use frozenhot::{FrozenHotCache, MARKER_KEY, TOMB_KEY};
pub use lru::LruCache;
pub use policy::{CachePolicy, CurvePoint};
pub use reservoir::{LatencyReservoir, LatencySummary};
pub use segment::SegmentCache;
pub use sharded::{ShardedCache, StepLatency};
pub use stats::{StatSnapshot, Statistics, StepRatios, Ticker};
