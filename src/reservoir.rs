//! Latency sample reservoir.
//!
//! A [`LatencyReservoir`] is a large append-only buffer of `f64`
//! microsecond samples backed by an anonymous memory mapping. The mapping
//! reserves address space up front and commits pages lazily, so a reservoir
//! sized for a long benchmark run costs nothing until samples arrive.
//!
//! Concurrency contract: any number of threads may [`insert`]; the slot
//! index is claimed with one atomic increment and the write itself is
//! relaxed. Aggregate reads ([`step`], [`summary`]) run on the monitor
//! thread after the claimed region has quiesced, which is the only ordering
//! the controller needs.
//!
//! [`insert`]: LatencyReservoir::insert
//! [`step`]: LatencyReservoir::step
//! [`summary`]: LatencyReservoir::summary

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::{MmapMut, MmapOptions};

/// Default reservoir capacity, in samples.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 1 << 26;

/// Mean and count of a cursor-delimited step window.
#[derive(Debug, Clone, Copy)]
pub struct StepMean {
    /// Mean of the samples in the window.
    pub mean: f64,
    /// Number of samples in the window.
    pub count: usize,
}

/// Percentile summary over every sample currently in the reservoir.
#[derive(Debug, Clone, Copy)]
pub struct LatencySummary {
    pub avg: f64,
    pub count: usize,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub p999: f64,
    pub p9999: f64,
}

/// Append-only mmap-backed sample buffer.
pub struct LatencyReservoir {
    /// Keeps the mapping alive; `data` points into it.
    #[allow(dead_code)]
    mmap: MmapMut,
    data: *mut f64,
    capacity: usize,
    len: AtomicUsize,
    cursor: AtomicUsize,
}

// SAFETY: samples are written through `data` only at indices claimed by the
// atomic `len` counter, so no two threads ever write the same slot, and
// readers only consume slots below a `len` they have already observed.
unsafe impl Send for LatencyReservoir {}
unsafe impl Sync for LatencyReservoir {}

impl LatencyReservoir {
    /// Map a reservoir for `capacity` samples.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let capacity = capacity.max(1);
        let mut mmap = MmapOptions::new()
            .len(capacity * std::mem::size_of::<f64>())
            .map_anon()?;
        let data = mmap.as_mut_ptr() as *mut f64;
        Ok(Self {
            mmap,
            data,
            capacity,
            len: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Append one sample. Samples past capacity are dropped.
    #[inline]
    pub fn insert(&self, value: f64) {
        let index = self.len.fetch_add(1, Ordering::Relaxed);
        if index < self.capacity {
            // SAFETY: `index` was uniquely claimed above and is in bounds.
            unsafe { self.data.add(index).write(value) };
        }
    }

    /// Number of samples currently stored.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples appended since the last [`step`](Self::step).
    pub fn step_len(&self) -> usize {
        let len = self.len();
        len.saturating_sub(self.cursor.load(Ordering::Relaxed))
    }

    /// Mean over the samples appended since the previous step, advancing the
    /// cursor past them. `None` when the window is empty.
    pub fn step(&self) -> Option<StepMean> {
        let len = self.len();
        let cursor = self.cursor.load(Ordering::Relaxed);
        if len == 0 || cursor >= len {
            return None;
        }
        let mut sum = 0.0;
        for i in cursor..len {
            // SAFETY: i < len <= capacity and the slot was published before
            // `len` advanced past it.
            sum += unsafe { self.data.add(i).read() };
        }
        let count = len - cursor;
        self.cursor.store(len, Ordering::Relaxed);
        Some(StepMean {
            mean: sum / count as f64,
            count,
        })
    }

    /// Percentile summary over all stored samples.
    ///
    /// Copies the samples out and sorts the copy, leaving the live buffer
    /// untouched by concurrent appenders.
    pub fn summary(&self) -> Option<LatencySummary> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let mut samples = Vec::with_capacity(len);
        for i in 0..len {
            // SAFETY: i < len <= capacity.
            samples.push(unsafe { self.data.add(i).read() });
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let sum: f64 = samples.iter().sum();
        let at = |f: f64| {
            let idx = ((len as f64 * f) as usize).min(len - 1);
            samples[idx]
        };
        Some(LatencySummary {
            avg: sum / len as f64,
            count: len,
            p50: at(0.50),
            p90: at(0.90),
            p99: at(0.99),
            p999: at(0.999),
            p9999: at(0.9999),
        })
    }

    /// Forget every sample and rewind the step cursor.
    pub fn reset(&self) {
        self.len.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_and_summary() {
        let set = LatencyReservoir::new(1024).unwrap();
        assert!(set.summary().is_none());
        for i in 1..=100 {
            set.insert(i as f64);
        }
        let summary = set.summary().unwrap();
        assert_eq!(summary.count, 100);
        assert!((summary.avg - 50.5).abs() < 1e-9);
        assert_eq!(summary.p50, 51.0);
        assert_eq!(summary.p99, 100.0);
    }

    #[test]
    fn test_step_windows() {
        let set = LatencyReservoir::new(1024).unwrap();
        assert!(set.step().is_none());

        set.insert(10.0);
        set.insert(20.0);
        let step = set.step().unwrap();
        assert_eq!(step.count, 2);
        assert!((step.mean - 15.0).abs() < 1e-9);

        // Window closed; nothing new to report.
        assert!(set.step().is_none());
        assert_eq!(set.step_len(), 0);

        set.insert(40.0);
        assert_eq!(set.step_len(), 1);
        let step = set.step().unwrap();
        assert_eq!(step.count, 1);
        assert!((step.mean - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let set = LatencyReservoir::new(64).unwrap();
        set.insert(1.0);
        set.insert(2.0);
        set.step();
        set.reset();
        assert!(set.is_empty());
        assert!(set.step().is_none());
        set.insert(3.0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_capacity_saturation() {
        let set = LatencyReservoir::new(4).unwrap();
        for i in 0..10 {
            set.insert(i as f64);
        }
        assert_eq!(set.len(), 4);
        assert_eq!(set.summary().unwrap().count, 4);
    }

    #[test]
    fn test_concurrent_inserts() {
        let set = Arc::new(LatencyReservoir::new(1 << 16).unwrap());
        let mut handles = Vec::new();
        for t in 0..8 {
            let set = Arc::clone(&set);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    set.insert((t * 1000 + i) as f64);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.len(), 8000);
        assert!(set.summary().unwrap().count == 8000);
    }
}
