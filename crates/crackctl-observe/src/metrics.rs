//! Control-loop metrics. The binary logs them periodically under the
//! `crackctl_metrics` target; there is no exporter.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Event count since start, plus how many arrived since the last periodic
/// report.
#[derive(Debug, Default)]
pub struct Tally {
    total: AtomicU64,
    reported: AtomicU64,
}

impl Tally {
    pub fn inc(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Events recorded since the previous call.
    pub fn take_delta(&self) -> u64 {
        let total = self.total();
        let prev = self.reported.fetch_max(total, Ordering::Relaxed);
        total.saturating_sub(prev)
    }
}

/// Last observed value and the highest value seen since start.
#[derive(Debug, Default)]
pub struct Level {
    current: AtomicU64,
    peak: AtomicU64,
}

impl Level {
    pub fn set(&self, value: u64) {
        self.current.store(value, Ordering::Relaxed);
        self.peak.fetch_max(value, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Wall time of completed ticks. A tick slower than its budget counts as an
/// overrun; the next tick then starts late.
#[derive(Debug, Default)]
pub struct TickTimings {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
    overruns: AtomicU64,
}

impl TickTimings {
    pub fn record(&self, took: Duration, budget: Duration) {
        let ms = took.as_millis().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
        if took > budget {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs `tick` to completion and records how long it took. A tick dropped
    /// before completing is not recorded.
    pub async fn time<F: Future>(&self, budget: Duration, tick: F) -> F::Output {
        let started = Instant::now();
        let out = tick.await;
        self.record(started.elapsed(), budget);
        out
    }

    pub fn snapshot(&self) -> TickTimingSnapshot {
        TickTimingSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_ms: self.total_ms.load(Ordering::Relaxed),
            max_ms: self.max_ms.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTimingSnapshot {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub overruns: u64,
}

impl TickTimingSnapshot {
    pub fn avg_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ms / self.count
        }
    }
}
