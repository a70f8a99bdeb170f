//! Counters and gauges exposed on `/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Alert outcome counters owned by the pipeline.
#[derive(Debug, Default)]
pub struct AlertCounters {
    sent: AtomicU64,
    queued: AtomicU64,
    debounced: AtomicU64,
    in_flight_suppressed: AtomicU64,
    dropped: AtomicU64,
}

impl AlertCounters {
    pub fn sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn debounced(&self) {
        self.debounced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight_suppressed(&self) {
        self.in_flight_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of every counter and gauge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queue_size: usize,
    pub dead_letter_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_fetches: u64,
    pub alerts_sent: u64,
    pub alerts_queued: u64,
    pub alerts_debounced: u64,
    pub alerts_in_flight_suppressed: u64,
    pub alerts_dropped: u64,
    pub retries_succeeded: u64,
    pub dead_lettered: u64,
    pub buffered_processes: usize,
}

impl MetricsSnapshot {
    /// Copy the alert counters into the snapshot.
    #[must_use]
    pub fn with_alerts(mut self, counters: &AlertCounters) -> Self {
        self.alerts_sent = counters.sent.load(Ordering::Relaxed);
        self.alerts_queued = counters.queued.load(Ordering::Relaxed);
        self.alerts_debounced = counters.debounced.load(Ordering::Relaxed);
        self.alerts_in_flight_suppressed = counters.in_flight_suppressed.load(Ordering::Relaxed);
        self.alerts_dropped = counters.dropped.load(Ordering::Relaxed);
        self
    }
}
