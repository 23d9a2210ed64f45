//! Process-wide worker counters.
//!
//! Updated by the consumer on every entry transition and read by the HTTP
//! surface. Each update is mirrored to the `metrics` facade so the Prometheus
//! exporter sees the same numbers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Live counters; all operations are lock-free and infallible
pub struct WorkerMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    pending: AtomicU64,
    concurrency_current: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub pending: u64,
    pub concurrency_current: u64,
    pub concurrency_limit: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            concurrency_current: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("worker.entries.processed").increment(1);
    }

    /// A failed attempt, before the retry decision
    pub fn record_failed(&self, kind: &'static str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("worker.entries.failed", "kind" => kind).increment(1);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("worker.entries.retried").increment(1);
    }

    pub fn record_dead_lettered(&self, kind: &'static str) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("worker.entries.dead_lettered", "kind" => kind).increment(1);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("worker.admission.deferred").increment(1);
    }

    pub fn pending_claimed(&self, count: u64) {
        let now = self.pending.fetch_add(count, Ordering::Relaxed) + count;
        metrics::gauge!("worker.entries.pending").set(now as f64);
    }

    /// One pending entry resolved; never wraps below zero
    pub fn pending_resolved(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(1)))
            .unwrap_or(0);
        metrics::gauge!("worker.entries.pending").set(previous.saturating_sub(1) as f64);
    }

    pub fn processing_started(&self) {
        let now = self.concurrency_current.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("worker.concurrency.current").set(now as f64);
    }

    pub fn processing_finished(&self) {
        let previous = self
            .concurrency_current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        metrics::gauge!("worker.concurrency.current").set(previous.saturating_sub(1) as f64);
    }

    pub fn record_limit(&self, limit: usize) {
        metrics::gauge!("worker.concurrency.limit").set(limit as f64);
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn snapshot(&self, concurrency_limit: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            concurrency_current: self.concurrency_current.load(Ordering::Relaxed),
            concurrency_limit: concurrency_limit as u64,
            started_at: self.started_at,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks an entry as processing for as long as it lives
pub struct ProcessingGuard<'a> {
    metrics: &'a WorkerMetrics,
}

impl<'a> ProcessingGuard<'a> {
    pub fn new(metrics: &'a WorkerMetrics) -> Self {
        metrics.processing_started();
        Self { metrics }
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.metrics.processing_finished();
    }
}
