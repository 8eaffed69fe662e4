use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::queue::QueueDepths;

/// Process-local counters. No exporter dependency: an external layer
/// scrapes `snapshot()` through whatever surface it wires up.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    pub executions_succeeded: AtomicU64,
    pub executions_failed: AtomicU64,
    pub executions_timed_out: AtomicU64,
    pub executions_skipped: AtomicU64,
    pub notifications_emitted: AtomicU64,
    pub sync_runs: AtomicU64,
    pub missed_jobs_found: AtomicU64,
    pub added_to_queue: AtomicU64,
    pub failed_to_enqueue: AtomicU64,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue: QueueDepths) -> MetricsSnapshot {
        MetricsSnapshot {
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_timed_out: self.executions_timed_out.load(Ordering::Relaxed),
            executions_skipped: self.executions_skipped.load(Ordering::Relaxed),
            notifications_emitted: self.notifications_emitted.load(Ordering::Relaxed),
            sync_runs: self.sync_runs.load(Ordering::Relaxed),
            missed_jobs_found: self.missed_jobs_found.load(Ordering::Relaxed),
            added_to_queue: self.added_to_queue.load(Ordering::Relaxed),
            failed_to_enqueue: self.failed_to_enqueue.load(Ordering::Relaxed),
            queue,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub executions_timed_out: u64,
    pub executions_skipped: u64,
    pub notifications_emitted: u64,
    pub sync_runs: u64,
    pub missed_jobs_found: u64,
    pub added_to_queue: u64,
    pub failed_to_enqueue: u64,
    pub queue: QueueDepths,
}
