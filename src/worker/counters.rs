// src/worker/counters.rs

//! Progress gauges shared between the worker and anyone watching a run.
//!
//! "Expected" gauges are held alive by RAII guards owned by the goals that
//! announced the work, so a goal that finishes (or is dropped on abort) can
//! never leave a stale expectation behind. Done/failed counts are plain
//! monotonic counters bumped by the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single atomic gauge that can be temporarily raised for the lifetime of
/// a [`GaugeGuard`].
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub(&self, delta: u64) {
        self.0.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Raise the gauge by `delta` until the returned guard is dropped.
    pub fn maintain(&self, delta: u64) -> GaugeGuard {
        self.add(delta);
        GaugeGuard {
            gauge: self.clone(),
            delta,
        }
    }
}

/// Holds a gauge increment; dropping it undoes the increment.
#[derive(Debug)]
pub struct GaugeGuard {
    gauge: Gauge,
    delta: u64,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.sub(self.delta);
    }
}

/// All gauges and counters for one run. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub expected_builds: Gauge,
    pub running_builds: Gauge,
    pub done_builds: Gauge,
    pub failed_builds: Gauge,

    pub expected_substitutions: Gauge,
    pub running_substitutions: Gauge,
    pub done_substitutions: Gauge,
    pub failed_substitutions: Gauge,

    /// Total uncompressed bytes announced by pending substitutions.
    pub expected_nar_size: Gauge,
    /// Total transfer bytes announced by pending substitutions.
    pub expected_download_size: Gauge,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            expected_builds: self.expected_builds.get(),
            running_builds: self.running_builds.get(),
            done_builds: self.done_builds.get(),
            failed_builds: self.failed_builds.get(),
            expected_substitutions: self.expected_substitutions.get(),
            running_substitutions: self.running_substitutions.get(),
            done_substitutions: self.done_substitutions.get(),
            failed_substitutions: self.failed_substitutions.get(),
            expected_nar_size: self.expected_nar_size.get(),
            expected_download_size: self.expected_download_size.get(),
        }
    }
}

/// Point-in-time copy of every counter, for progress displays and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub expected_builds: u64,
    pub running_builds: u64,
    pub done_builds: u64,
    pub failed_builds: u64,
    pub expected_substitutions: u64,
    pub running_substitutions: u64,
    pub done_substitutions: u64,
    pub failed_substitutions: u64,
    pub expected_nar_size: u64,
    pub expected_download_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_undoes_increment_on_drop() {
        let gauge = Gauge::default();
        {
            let _a = gauge.maintain(1);
            let _b = gauge.maintain(3);
            assert_eq!(gauge.get(), 4);
        }
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn clones_share_state() {
        let counters = Counters::default();
        let other = counters.clone();
        counters.done_builds.add(2);
        assert_eq!(other.snapshot().done_builds, 2);
    }
}
