use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::errors::Result;
use crate::metrics::CoreMetrics;
use crate::models::{DispatchEnvelope, Job};
use crate::queue::{DispatchQueue, EnqueueOutcome, MANUAL_PRIORITY, SCHEDULED_PRIORITY};
use crate::store::JobStore;

/// Jobs examined per safety-sync pass.
const SYNC_BATCH_LIMIT: usize = 1000;

/// Narrow contract the executor uses to reschedule recurring jobs,
/// breaking the scheduler/executor dependency cycle.
#[async_trait]
pub trait Rescheduler: Send + Sync {
    async fn reschedule(&self, job: &Job) -> Result<()>;
}

/// Outcome of one safety-sync pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct SyncReport {
    pub missed_jobs_found: u64,
    pub added_to_queue: u64,
    pub failed_to_enqueue: u64,
    pub sync_duration_ms: u64,
}

/// Translates job lifecycle events into queue operations and owns the
/// periodic safety sync.
///
/// Correctness rests on the store being the single source of truth for
/// `next_run` and the queue's idempotent enqueue: a job whose dispatch
/// is still live is re-offered harmlessly.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CoreMetrics>,
    sync_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CoreMetrics>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            metrics,
            sync_interval: config.safety_sync_interval(),
        }
    }

    /// Enqueue a job's next firing: `delay = max(0, next_run - now)`.
    pub async fn schedule_job(&self, job: &Job) -> Result<EnqueueOutcome> {
        let delay = job
            .next_run
            .map(|next_run| (next_run - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        let outcome = self
            .queue
            .enqueue(
                DispatchEnvelope::from_job(job),
                delay,
                SCHEDULED_PRIORITY,
                job.max_retries + 1,
            )
            .await?;

        match outcome {
            EnqueueOutcome::Enqueued => {
                tracing::debug!(job_id = %job.id, delay_secs = delay.as_secs(), "job enqueued");
            }
            EnqueueOutcome::AlreadyEnqueued => {
                tracing::debug!(job_id = %job.id, "dispatch already live, enqueue skipped");
            }
        }
        Ok(outcome)
    }

    /// Remove a job's pending dispatch (pause, delete). Best-effort: a
    /// run already claimed by a worker continues to completion.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.queue.remove(job_id).await
    }

    /// Replace a job's pending dispatch after its schedule changed.
    pub async fn requeue(&self, job: &Job) -> Result<EnqueueOutcome> {
        self.queue.remove(job.id).await?;
        self.schedule_job(job).await
    }

    /// Enqueue a manual run at priority 1. Shares the job's dispatch key:
    /// colliding with an already-scheduled run is a no-op, so two
    /// back-to-back triggers cannot produce overlapping executions.
    pub async fn trigger(&self, job: &Job) -> Result<EnqueueOutcome> {
        self.queue
            .enqueue(
                DispatchEnvelope::manual_from_job(job),
                Duration::ZERO,
                MANUAL_PRIORITY,
                job.max_retries + 1,
            )
            .await
    }

    /// One reconciliation pass: re-offer every due active job to the
    /// queue. Lost dispatch state (queue crash, fleet outage, restart
    /// after clean shutdown) is repaired here; live dispatches make the
    /// enqueue a no-op.
    pub async fn run_safety_sync(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        let due = self
            .store
            .claim_due_jobs(SYNC_BATCH_LIMIT, self.clock.now())
            .await?;

        for job in &due {
            match self
                .queue
                .enqueue(
                    DispatchEnvelope::from_job(job),
                    Duration::ZERO,
                    SCHEDULED_PRIORITY,
                    job.max_retries + 1,
                )
                .await
            {
                Ok(EnqueueOutcome::Enqueued) => {
                    report.missed_jobs_found += 1;
                    report.added_to_queue += 1;
                    tracing::warn!(job_id = %job.id, next_run = ?job.next_run, "missed job re-enqueued");
                }
                Ok(EnqueueOutcome::AlreadyEnqueued) => {
                    // dispatch still live; nothing was lost
                }
                Err(e) => {
                    report.failed_to_enqueue += 1;
                    tracing::error!(job_id = %job.id, "safety sync enqueue failed: {}", e);
                }
            }
        }

        report.sync_duration_ms = started.elapsed().as_millis() as u64;

        CoreMetrics::incr(&self.metrics.sync_runs);
        CoreMetrics::add(&self.metrics.missed_jobs_found, report.missed_jobs_found);
        CoreMetrics::add(&self.metrics.added_to_queue, report.added_to_queue);
        CoreMetrics::add(&self.metrics.failed_to_enqueue, report.failed_to_enqueue);

        tracing::info!(
            examined = due.len(),
            missed_jobs_found = report.missed_jobs_found,
            added_to_queue = report.added_to_queue,
            failed_to_enqueue = report.failed_to_enqueue,
            sync_duration_ms = report.sync_duration_ms,
            "safety sync complete"
        );
        Ok(report)
    }

    /// Periodic safety-sync loop. Runs until the shutdown signal flips.
    pub async fn run_safety_sync_loop(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sync_interval) => {
                    if let Err(e) = self.run_safety_sync().await {
                        tracing::error!("safety sync pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("safety sync loop stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Rescheduler for Scheduler {
    async fn reschedule(&self, job: &Job) -> Result<()> {
        self.schedule_job(job).await?;
        Ok(())
    }
}
