//! Cache Correctness Tests
//!
//! Validates the universal invariants that hold for every policy, shard
//! count and interleaving, plus the policy-specific eviction semantics:
//!
//! 1. **Universal invariants**: capacity bound, value preservation,
//!    idempotent insert, erase-then-miss, size monotonicity.
//! 2. **Policy semantics**: FIFO insertion order, LRU recency, segment
//!    coarse recency.
//!
//! Single-shard instances are used where eviction order must be exactly
//! predictable; multi-shard instances where only the aggregate bound
//! matters.

use hotcache::{CacheOptions, PolicyKind, SegmentConfig, ShardedCache};

fn cache(capacity: u64, shards: u32, policy: PolicyKind) -> ShardedCache<u64> {
    let mut options = CacheOptions::new(capacity, shards, policy);
    options.monitor.enabled = false;
    options.sample_capacity = 1 << 12;
    options.segment = SegmentConfig {
        slots_per_segment: 8,
        min_segments: 1,
    };
    ShardedCache::new(options).expect("valid options")
}

const ALL_POLICIES: [PolicyKind; 4] = [
    PolicyKind::Fifo,
    PolicyKind::Lru,
    PolicyKind::Segment,
    PolicyKind::FrozenHot,
];

// ============================================================================
// UNIVERSAL INVARIANTS
// ============================================================================

#[test]
fn test_value_preservation() {
    for policy in ALL_POLICIES {
        let cache = cache(64, 2, policy);
        cache.insert(10, 100);
        cache.insert(11, 110);
        assert_eq!(cache.lookup(10), Some(100), "{policy:?}");
        assert_eq!(cache.lookup(11), Some(110), "{policy:?}");
        assert_eq!(cache.lookup(12), None, "{policy:?}");
    }
}

#[test]
fn test_insert_idempotence() {
    for policy in ALL_POLICIES {
        let cache = cache(64, 2, policy);
        assert!(cache.insert(10, 1), "{policy:?}");
        assert!(!cache.insert(10, 1), "{policy:?}");
        assert_eq!(cache.lookup(10), Some(1), "{policy:?}");
        assert_eq!(cache.size(), 1, "{policy:?}");
    }
}

#[test]
fn test_update_overwrites_in_place() {
    for policy in ALL_POLICIES {
        let cache = cache(64, 2, policy);
        cache.insert(10, 1);
        assert!(!cache.insert(10, 2), "{policy:?}");
        assert_eq!(cache.lookup(10), Some(2), "{policy:?}");
    }
}

#[test]
fn test_erase_then_miss() {
    for policy in ALL_POLICIES {
        let cache = cache(64, 2, policy);
        cache.insert(10, 1);
        assert!(cache.erase(10), "{policy:?}");
        assert_eq!(cache.lookup(10), None, "{policy:?}");
        assert!(!cache.erase(10), "{policy:?}");
    }
}

#[test]
fn test_capacity_bound_after_quiescence() {
    // After any quiescent run of inserts, size() <= capacity. The segment
    // policy is allowed one segment of slack per shard by design, which
    // the small segment config keeps tight.
    for policy in [PolicyKind::Fifo, PolicyKind::Lru, PolicyKind::FrozenHot] {
        let cache = cache(32, 4, policy);
        for key in 10..1000 {
            cache.insert(key, key);
        }
        assert!(cache.size() <= 32, "{policy:?}: size {}", cache.size());
    }
    let cache = cache(32, 1, PolicyKind::Segment);
    for key in 10..1000 {
        cache.insert(key, key);
    }
    assert!(
        cache.size() <= 32 + 8,
        "segment: size {} beyond slack",
        cache.size()
    );
}

#[test]
fn test_size_monotonic_while_filling() {
    for policy in ALL_POLICIES {
        let cache = cache(64, 2, policy);
        let mut last = 0;
        for key in 10..60 {
            cache.insert(key, key);
            let size = cache.size();
            assert!(size >= last, "{policy:?}: size dropped before capacity");
            last = size;
        }
    }
}

// ============================================================================
// FIFO SEMANTICS
// ============================================================================

#[test]
fn test_fifo_boundary_scenario() {
    // capacity=3: insert 1..=4, the first key is gone, the rest remain.
    let cache = cache(3, 1, PolicyKind::Fifo);
    cache.insert(1, 0xA);
    cache.insert(2, 0xB);
    cache.insert(3, 0xC);
    cache.insert(4, 0xD);
    assert_eq!(cache.lookup(1), None);
    assert_eq!(cache.lookup(2), Some(0xB));
    assert_eq!(cache.lookup(3), Some(0xC));
    assert_eq!(cache.lookup(4), Some(0xD));
}

#[test]
fn test_fifo_eviction_ignores_recency() {
    // With capacity C and 2C distinct inserts, exactly the last C survive,
    // no matter how often the early keys are read.
    let capacity = 8u64;
    let cache = cache(capacity, 1, PolicyKind::Fifo);
    for key in 0..capacity {
        cache.insert(key, key);
        cache.lookup(0);
    }
    for key in capacity..2 * capacity {
        cache.insert(key, key);
        cache.lookup(0);
    }
    for key in 0..capacity {
        assert_eq!(cache.lookup(key), None, "old key {} resident", key);
    }
    for key in capacity..2 * capacity {
        assert_eq!(cache.lookup(key), Some(key), "new key {} missing", key);
    }
}

// ============================================================================
// LRU SEMANTICS
// ============================================================================

#[test]
fn test_lru_promotion_scenario() {
    // capacity=3: touch 1, then insert 4; 2 is the victim.
    let cache = cache(3, 1, PolicyKind::Lru);
    cache.insert(1, 0xA);
    cache.insert(2, 0xB);
    cache.insert(3, 0xC);
    assert_eq!(cache.lookup(1), Some(0xA));
    cache.insert(4, 0xD);
    assert_eq!(cache.lookup(1), Some(0xA));
    assert_eq!(cache.lookup(2), None);
}

#[test]
fn test_lru_recency_protects_half() {
    // Insert 0..C, touch 0..C/2, insert C..3C/2; the touched half stays.
    let capacity = 16u64;
    let cache = cache(capacity, 1, PolicyKind::Lru);
    for key in 0..capacity {
        cache.insert(key, key);
    }
    for key in 0..capacity / 2 {
        assert!(cache.lookup(key).is_some());
    }
    for key in capacity..capacity + capacity / 2 {
        cache.insert(key, key);
    }
    for key in 0..capacity / 2 {
        assert_eq!(cache.lookup(key), Some(key), "touched key {} evicted", key);
    }
}

// ============================================================================
// SEGMENT SEMANTICS
// ============================================================================

#[test]
fn test_segment_promotion_across_boundary() {
    // S=4, capacity=8: insert 1..=8, touch 1..=4, insert 9..=12.
    // The touched keys hit; some of 5..=8 may have been evicted.
    let mut options = CacheOptions::new(8, 1, PolicyKind::Segment);
    options.monitor.enabled = false;
    options.sample_capacity = 1 << 12;
    options.segment = SegmentConfig {
        slots_per_segment: 4,
        min_segments: 1,
    };
    let cache: ShardedCache<u64> = ShardedCache::new(options).unwrap();

    for key in 1..=8 {
        cache.insert(key, key);
    }
    for key in 1..=4 {
        assert!(cache.lookup(key).is_some());
    }
    for key in 9..=12 {
        cache.insert(key, key);
    }
    for key in 1..=4 {
        assert_eq!(cache.lookup(key), Some(key), "promoted key {} missing", key);
    }
    for key in 9..=12 {
        assert_eq!(cache.lookup(key), Some(key));
    }
}

#[test]
fn test_segment_coarse_recency() {
    // capacity = k*S; after 2C distinct inserts the most recent ~C keys
    // are resident within one segment of slack.
    let slots = 8u64;
    let capacity = 4 * slots;
    let mut options = CacheOptions::new(capacity, 1, PolicyKind::Segment);
    options.monitor.enabled = false;
    options.sample_capacity = 1 << 12;
    options.segment = SegmentConfig {
        slots_per_segment: slots as u32,
        min_segments: 1,
    };
    let cache: ShardedCache<u64> = ShardedCache::new(options).unwrap();

    for key in 0..2 * capacity {
        cache.insert(key, key);
    }
    for key in (2 * capacity - capacity / 2)..2 * capacity {
        assert_eq!(cache.lookup(key), Some(key), "recent key {} missing", key);
    }
    for key in 0..capacity / 2 {
        assert_eq!(cache.lookup(key), None, "stale key {} resident", key);
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

#[test]
fn test_keys_route_to_fixed_shards() {
    // The same key must always resolve to the same shard: a value written
    // through one handle is observed through any sequence of operations.
    let cache = cache(64, 8, PolicyKind::Lru);
    for key in 10..70 {
        cache.insert(key, key * 3);
    }
    for key in 10..70 {
        assert_eq!(cache.lookup(key), Some(key * 3));
    }
    for key in (10..70).step_by(2) {
        assert!(cache.erase(key));
    }
    for key in 10..70 {
        let expected = if key % 2 == 0 { None } else { Some(key * 3) };
        assert_eq!(cache.lookup(key), expected);
    }
}

#[test]
fn test_stats_tickers_aggregate() {
    use hotcache::Ticker;
    let cache = cache(64, 4, PolicyKind::Lru);
    for key in 10..20 {
        cache.insert(key, key);
    }
    for key in 10..20 {
        cache.lookup(key);
    }
    for key in 100..105 {
        cache.lookup(key);
    }
    assert_eq!(cache.ticker_total(Ticker::Insert), 10);
    assert_eq!(cache.ticker_total(Ticker::CacheHit), 10);
    assert_eq!(cache.ticker_total(Ticker::CacheMiss), 5);
}
