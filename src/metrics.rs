//! Content resolution metrics.
//!
//! Counts which tier answered each request and how background polls
//! settled. Each resolver owns its own instance.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct ResolutionMetrics {
    /// Requests answered by the reactive cache
    reactive_hits: AtomicUsize,

    /// Requests answered by the local persistent store
    store_hits: AtomicUsize,

    /// Remote fetches attempted
    remote_fetches: AtomicUsize,

    /// Remote fetches that failed
    remote_failures: AtomicUsize,

    /// Background polls kicked (joined in-flight polls included)
    polls_started: AtomicUsize,

    polls_completed: AtomicUsize,
    polls_failed: AtomicUsize,
}

impl ResolutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reactive_hit(&self) {
        self.reactive_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_hit(&self) {
        self.store_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_fetch(&self) {
        self.remote_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_started(&self) {
        self.polls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_completed(&self) {
        self.polls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failed(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Generate a metrics report.
    pub fn report(&self) -> MetricsReport {
        let reactive_hits = self.reactive_hits.load(Ordering::Relaxed);
        let store_hits = self.store_hits.load(Ordering::Relaxed);
        let remote_fetches = self.remote_fetches.load(Ordering::Relaxed);
        let remote_failures = self.remote_failures.load(Ordering::Relaxed);

        let total = reactive_hits + store_hits + remote_fetches;
        let local_hit_rate = if total > 0 {
            ((reactive_hits + store_hits) as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let remote_success_rate = if remote_fetches > 0 {
            ((remote_fetches - remote_failures) as f64 / remote_fetches as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            reactive_hits,
            store_hits,
            remote_fetches,
            remote_failures,
            local_hit_rate,
            remote_success_rate,
            polls_started: self.polls_started.load(Ordering::Relaxed),
            polls_completed: self.polls_completed.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of resolution statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub reactive_hits: usize,
    pub store_hits: usize,
    pub remote_fetches: usize,
    pub remote_failures: usize,

    /// Share of requests answered without the network, as a percentage (0-100)
    pub local_hit_rate: f64,

    /// Remote success rate as a percentage (0-100)
    pub remote_success_rate: f64,

    pub polls_started: usize,
    pub polls_completed: usize,
    pub polls_failed: usize,
}
