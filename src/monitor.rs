//! Monitor / controller.
//!
//! One monitor thread runs per cache instance. For the FrozenHot policy it
//! drives the tiering state machine; for every other policy it degenerates
//! to a periodic statistics report.
//!
//! The controller is an explicit state machine: each phase function
//! observes, acts on the shards, and returns the next phase:
//!
//! ```text
//!               +--------------------------------------------+
//!               v                                            |
//!   WaitStable ---> Profile ---> Construct ---> Frozen ---> Deconstruct
//!       ^              |             |            |
//!       |   unsuitable |      failed |            | periodic refresh
//!       +--------------+------------<+            +---> Construct
//! ```
//!
//! Every sleep is chunked and re-checks the shared stop flag, so the
//! monitor exits within one poll interval of `stop()`.
//!
//! The latency model used to pick the fast-tier size, for each profiled
//! point `(size, FC_hit, miss)`:
//!
//! ```text
//! avg = FC_hit * L_fc + miss * (L_miss + L_fc)
//!     + (1 - FC_hit - miss) * (L_fc + L_dc)
//! ```
//!
//! with the size-zero baseline discounted by the fast-performance margin,
//! tail points above 0.65 snapped to a full freeze, and the winner compared
//! against the measured frozen-all average.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{MonitorConfig, PolicyKind};
use crate::sharded::CacheInner;

/// Largest chunk a monitor sleep will block without re-checking the stop
/// flag.
const STOP_POLL: Duration = Duration::from_millis(10);

enum Phase {
    WaitStable,
    Profile,
    Construct { best_size: f64 },
    Frozen {
        best_size: f64,
        construct_step: u64,
        baseline_with_margin: f64,
    },
    Deconstruct,
    Stopped,
}

/// Monitor entry point; runs until the stop flag is set.
pub(crate) fn run<V: Clone + Send + Sync + 'static>(inner: Arc<CacheInner<V>>) {
    tracing::info!(policy = ?inner.policy, shards = inner.num_shards, "monitor started");
    match inner.policy {
        PolicyKind::FrozenHot => run_frozen(&inner),
        _ => run_observer(&inner),
    }
    tracing::info!("monitor stopped");
}

fn stopped<V>(inner: &CacheInner<V>) -> bool {
    inner.stop.load(Ordering::Acquire)
}

/// Sleep `duration`, waking early when the stop flag is raised.
fn sleep_interruptible<V>(inner: &CacheInner<V>, duration: Duration) {
    let mut remaining = duration;
    while !stopped(inner) && remaining > Duration::ZERO {
        let chunk = remaining.min(STOP_POLL);
        std::thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}

/// Back-off loop shared by the unsuitable-workload gate and deconstruct:
/// sleep `seconds`, reporting once per second.
fn observe_for_seconds<V>(inner: &CacheInner<V>, seconds: u32) {
    for _ in 0..seconds {
        if stopped(inner) {
            return;
        }
        sleep_interruptible(inner, Duration::from_secs(1));
        let _ = inner.drain_miss_ratio();
        let _ = inner.step_latency();
    }
}

/// Statistics loop for the non-tiering policies: observe until the miss
/// ratio stabilizes, then report forever.
fn run_observer<V>(inner: &CacheInner<V>) {
    let cfg = inner.monitor_cfg;
    wait_stable(inner, &cfg);
    if stopped(inner) {
        return;
    }
    tracing::info!("cache stable; reporting");
    inner.global_latency();
    while !stopped(inner) {
        sleep_interruptible(inner, Duration::from_secs(1));
        let _ = inner.drain_miss_ratio();
        let _ = inner.step_latency();
    }
}

/// Observe until the miss ratio is non-decreasing while occupancy is
/// non-increasing for the configured number of consecutive samples.
fn wait_stable<V>(inner: &CacheInner<V>, cfg: &MonitorConfig) {
    let mut last_miss = 1.0f64;
    let mut miss = 0.0f64;
    let mut last_size = 0u64;
    let mut size = 0u64;
    let mut waits = 0u32;
    while !stopped(inner) {
        if let Some(ratio) = inner.drain_miss_ratio() {
            miss = ratio;
        }
        let _ = inner.step_latency();
        if last_size >= size {
            if last_miss <= miss {
                waits += 1;
            }
            if waits >= cfg.wait_stable_threshold {
                tracing::info!(
                    miss,
                    size,
                    capacity = inner.capacity,
                    "occupancy and miss ratio stable"
                );
                return;
            }
        }
        last_size = size;
        size = inner.total_size();
        last_miss = miss;
        sleep_interruptible(inner, cfg.wait_stable_interval);
    }
}

fn run_frozen<V: Clone + Send + Sync + 'static>(inner: &CacheInner<V>) {
    let cfg = inner.monitor_cfg;
    let mut sleep_threshold = cfg.sleep_threshold_secs.max(1);
    let mut beginning = true;
    let mut phase = Phase::WaitStable;
    loop {
        if stopped(inner) {
            break;
        }
        phase = match phase {
            Phase::WaitStable => {
                wait_stable(inner, &cfg);
                if stopped(inner) {
                    Phase::Stopped
                } else {
                    if beginning {
                        // Clear warm-up noise before the first profile.
                        inner.global_latency();
                        beginning = false;
                    }
                    Phase::Profile
                }
            }
            Phase::Profile => profile(inner, &cfg, &mut sleep_threshold),
            Phase::Construct { best_size } => construct(inner, &cfg, best_size),
            Phase::Frozen {
                best_size,
                construct_step,
                baseline_with_margin,
            } => frozen(
                inner,
                &cfg,
                best_size,
                construct_step,
                baseline_with_margin,
                &mut sleep_threshold,
            ),
            Phase::Deconstruct => {
                for shard in &inner.shards {
                    shard.delete_fast_cache();
                }
                observe_for_seconds(inner, sleep_threshold);
                Phase::WaitStable
            }
            Phase::Stopped => break,
        };
    }
}

/// Profile the curve, measure the tier latencies, and pick the best
/// fast-tier size.
fn profile<V: Clone + Send + Sync + 'static>(
    inner: &CacheInner<V>,
    cfg: &MonitorConfig,
    sleep_threshold: &mut u32,
) -> Phase {
    // One representative shard profiles the curve for the instance.
    inner.shards[0].get_curve(&inner.stop);

    while !stopped(inner) && inner.other_latency.step_len() < cfg.min_profile_step {
        sleep_interruptible(inner, cfg.wait_stable_interval);
    }
    if stopped(inner) {
        return Phase::Stopped;
    }
    let _ = inner.drain_miss_ratio();
    let Some(base) = inner.step_latency() else {
        return Phase::WaitStable;
    };
    let dc_hit_lat = base.avg_hit;
    let miss_lat = base.avg_other;

    // 100%-frozen probe: freeze everything, observe, thaw.
    for shard in &inner.shards {
        shard.construct_tier();
    }
    let _ = inner.drain_miss_ratio();
    let _ = inner.step_latency();
    sleep_interruptible(inner, cfg.wait_stable_interval);
    let frozen_miss = inner.drain_miss_ratio().unwrap_or(1.0);
    let frozen_step = inner.step_latency();
    for shard in &inner.shards {
        shard.delete_fast_cache();
    }
    let (fc_hit_lat, disk_lat, frozen_avg) = match frozen_step {
        Some(step) => (step.avg_hit, step.avg_other, step.avg),
        None => (dc_hit_lat, miss_lat, f64::INFINITY),
    };

    let curve = inner.shards[0].take_curve();
    let mut best_avg = f64::INFINITY;
    let mut best_size = 0.0f64;
    let points = curve.len();
    for (i, point) in curve.iter().enumerate() {
        let mut size = point.size;
        let avg = if size < 0.01 {
            size = 0.0;
            (point.miss * miss_lat + (1.0 - point.miss) * dc_hit_lat)
                / (1.0 + cfg.fast_performance_margin)
        } else {
            if i + 1 == points && size > 0.65 {
                size = 1.0;
            }
            point.fc_hit * fc_hit_lat
                + point.miss * (miss_lat + fc_hit_lat)
                + (1.0 - point.fc_hit - point.miss) * (fc_hit_lat + dc_hit_lat)
        };
        if avg < best_avg {
            best_avg = avg;
            best_size = size;
        }
    }
    if frozen_avg < best_avg {
        best_avg = frozen_avg;
        best_size = 1.0;
    }
    tracing::info!(
        best_size,
        best_avg,
        dc_hit_lat,
        miss_lat,
        fc_hit_lat,
        disk_lat,
        frozen_miss,
        points,
        "profiling complete"
    );

    if best_size < cfg.suitability_gate {
        // Workload unsuited to freezing; back off and re-observe.
        *sleep_threshold = sleep_threshold.saturating_mul(8);
        tracing::info!(sleep_threshold = *sleep_threshold, "workload unsuitable");
        observe_for_seconds(inner, *sleep_threshold);
        return Phase::WaitStable;
    }
    Phase::Construct { best_size }
}

/// Measure a baseline, build the tier, and validate it over a few passes.
fn construct<V: Clone + Send + Sync + 'static>(
    inner: &CacheInner<V>,
    cfg: &MonitorConfig,
    best_size: f64,
) -> Phase {
    while !stopped(inner) && inner.step_size() < cfg.min_construct_step {
        sleep_interruptible(inner, cfg.wait_stable_interval);
    }
    if stopped(inner) {
        return Phase::Stopped;
    }
    let _ = inner.drain_miss_ratio();
    let Some(base) = inner.step_latency() else {
        return Phase::WaitStable;
    };
    let baseline_performance = base.avg;
    let mut construct_step = base.count as u64;
    let baseline_with_margin = baseline_performance / (1.0 + cfg.fast_performance_margin);
    tracing::info!(baseline_performance, baseline_with_margin, "construct baseline");

    sleep_interruptible(inner, cfg.wait_stable_interval);
    let baseline_metric = inner
        .step_latency()
        .map_or(baseline_performance, |step| step.avg);

    for shard in &inner.shards {
        if (best_size - 1.0).abs() < 1e-4 {
            shard.construct_tier();
        } else {
            shard.construct_fast_cache(best_size);
        }
        shard.stats().reset_cursor();
    }

    let mut pass = 0u32;
    while !stopped(inner) && pass < cfg.pass_threshold {
        sleep_interruptible(inner, cfg.check_interval);
        while !stopped(inner) && inner.step_size() < cfg.min_frozen_step {
            sleep_interruptible(inner, cfg.check_interval);
        }
        if stopped(inner) {
            return Phase::Stopped;
        }
        let Some(step) = inner.step_latency() else {
            continue;
        };
        construct_step += step.count as u64;
        if step.avg > baseline_metric / (1.0 + cfg.fast_performance_margin) {
            tracing::info!(
                performance = step.avg,
                baseline_metric,
                "fast tier not paying off; tearing down"
            );
            for shard in &inner.shards {
                shard.delete_fast_cache();
            }
            return Phase::WaitStable;
        }
        tracing::debug!(pass, performance = step.avg, "construct validation pass");
        pass += 1;
    }
    if stopped(inner) {
        return Phase::Stopped;
    }
    tracing::info!(construct_step, "construction validated");
    Phase::Frozen {
        best_size,
        construct_step: construct_step.max(1),
        baseline_with_margin,
    }
}

/// Watch the frozen tier, spending the performance-depletion credit as the
/// measured latency drifts from the baseline.
fn frozen<V: Clone + Send + Sync + 'static>(
    inner: &CacheInner<V>,
    cfg: &MonitorConfig,
    best_size: f64,
    construct_step: u64,
    baseline_with_margin: f64,
    sleep_threshold: &mut u32,
) -> Phase {
    let mut depletion = cfg.drop_threshold;
    let mut first = true;
    let mut baseline_step = 1u64;
    let mut sum_step = 0u64;
    let mut now_step = 0u64;

    loop {
        while !stopped(inner) && inner.step_size() < cfg.min_frozen_step {
            sleep_interruptible(inner, cfg.check_interval);
        }
        if stopped(inner) {
            return Phase::Stopped;
        }
        inner.drain_frozen_stat();
        let Some(step) = inner.step_latency() else {
            continue;
        };
        let temp_step = step.count as u64;
        if first {
            baseline_step = temp_step.max(1);
            first = false;
        }
        if baseline_with_margin > 0.0 {
            let delta = (baseline_with_margin - step.avg) / baseline_with_margin
                * temp_step as f64
                / baseline_step as f64;
            depletion += delta;
        }
        if depletion <= 0.0 {
            tracing::info!(depletion, "fast tier benefit depleted");
            *sleep_threshold = sleep_threshold.saturating_mul(8);
            return Phase::Deconstruct;
        }

        sum_step += temp_step;
        now_step += temp_step;
        if sum_step > construct_step.saturating_mul(cfg.frozen_threshold) {
            // Long-lived tier; refresh it against working-set drift.
            tracing::info!(sum_step, construct_step, "periodic fast-tier refresh");
            for shard in &inner.shards {
                shard.delete_fast_cache();
            }
            sleep_interruptible(inner, cfg.wait_stable_interval);
            if *sleep_threshold >= 2 {
                *sleep_threshold /= 2;
            }
            return Phase::Construct { best_size };
        } else if now_step > construct_step {
            if depletion > cfg.drop_threshold {
                // Still outperforming; re-arm the credit so later
                // degradation is noticed promptly.
                depletion = cfg.drop_threshold;
                now_step = 0;
            } else {
                tracing::info!(now_step, depletion, "fast tier fading; rebuilding");
                for shard in &inner.shards {
                    shard.delete_fast_cache();
                }
                sleep_interruptible(inner, cfg.wait_stable_interval);
                return Phase::Construct { best_size };
            }
        }
    }
}
