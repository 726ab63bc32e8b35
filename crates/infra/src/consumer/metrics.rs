use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Lock-free counters of one tenant consumer.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub(crate) messages_read: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) foreign: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) bus_calls: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerMetricsSnapshot {
    pub messages_read: u64,
    pub completed: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub foreign: u64,
    pub retried: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub bus_calls: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub in_flight: usize,
}

impl ConsumerMetricsSnapshot {
    /// Share of tenant messages that were already applied (idempotency hits).
    pub fn duplicate_rate(&self) -> f64 {
        let own = self.messages_read.saturating_sub(self.foreign);
        if own == 0 { 0.0 } else { self.duplicates as f64 / own as f64 }
    }
}

impl ConsumerMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ConsumerMetricsSnapshot {
            messages_read: load(&self.messages_read),
            completed: load(&self.completed),
            skipped: load(&self.skipped),
            duplicates: load(&self.duplicates),
            foreign: load(&self.foreign),
            retried: load(&self.retried),
            failed: load(&self.failed),
            dead_lettered: load(&self.dead_lettered),
            bus_calls: load(&self.bus_calls),
            errors: load(&self.errors),
            reconnects: load(&self.reconnects),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Tracks one in-flight message for the lifetime of the guard.
pub(crate) struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
