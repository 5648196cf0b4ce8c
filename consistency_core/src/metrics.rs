// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Lock-free latency tracking for protocol phases.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Latency of one protocol phase across transactions, in microseconds.
///
/// A sample at or above `slow_after` is also counted as slow.
#[derive(Debug)]
pub struct PhaseLatency {
    samples: AtomicU64,
    sum_us: AtomicU64,
    fastest_us: AtomicU64,
    slowest_us: AtomicU64,
    last_us: AtomicU64,
    slow: AtomicU64,
    slow_after_us: u64,
}

impl Default for PhaseLatency {
    fn default() -> Self {
        Self::with_slow_threshold(Duration::from_secs(1))
    }
}

impl PhaseLatency {
    pub fn with_slow_threshold(slow_after: Duration) -> Self {
        Self {
            samples: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            fastest_us: AtomicU64::new(u64::MAX),
            slowest_us: AtomicU64::new(0),
            last_us: AtomicU64::new(0),
            slow: AtomicU64::new(0),
            slow_after_us: micros(slow_after),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let us = micros(elapsed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.fastest_us.fetch_min(us, Ordering::Relaxed);
        self.slowest_us.fetch_max(us, Ordering::Relaxed);
        self.last_us.store(us, Ordering::Relaxed);
        if us >= self.slow_after_us {
            self.slow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Observe the time elapsed since `start` and return it.
    pub fn observe_since(&self, start: Instant) -> Duration {
        let elapsed = start.elapsed();
        self.observe(elapsed);
        elapsed
    }

    pub fn summary(&self) -> LatencySummary {
        let samples = self.samples.load(Ordering::Relaxed);
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        let fastest = self.fastest_us.load(Ordering::Relaxed);
        LatencySummary {
            samples,
            mean_us: sum_us.checked_div(samples).unwrap_or(0),
            fastest_us: if samples == 0 { 0 } else { fastest },
            slowest_us: self.slowest_us.load(Ordering::Relaxed),
            last_us: self.last_us.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
        }
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Serializable view of a [`PhaseLatency`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub mean_us: u64,
    pub fastest_us: u64,
    pub slowest_us: u64,
    pub last_us: u64,
    pub slow: u64,
}
