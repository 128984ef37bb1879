//! Monotonic clock helpers.
//!
//! All recency stamps and latency measurements in the crate go through this
//! module so there is exactly one notion of "now": microseconds since the
//! first clock read of the process, taken from a precise monotonic source.

use std::sync::OnceLock;

use clocksource::precise::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed since the process-local epoch.
///
/// The first call establishes the epoch, so values start near zero and are
/// strictly comparable within a process. The reading is monotonic.
#[inline]
pub fn now_micros() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    ((Instant::now() - epoch).as_nanos() / 1_000) as u64
}
