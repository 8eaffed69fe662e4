use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::Result;
use crate::models::{
    Execution, ExecutionLog, Job, JobFilter, JobPatch, JobStatus, NewJob, Page, PageRequest,
};
use crate::scheduler::Scheduler;
use crate::store::JobStore;

/// Default lookahead for `upcoming_jobs`.
const DEFAULT_UPCOMING_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TriggerReceipt {
    pub status: &'static str,
}

/// Owner-scoped control operations, consumed by whatever transport the
/// deployment puts in front (HTTP, gRPC, CLI). Wire format is the
/// transport's concern; this facade owns validation, store mutations,
/// and the matching queue operations.
pub struct ControlSurface {
    store: Arc<dyn JobStore>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
}

impl ControlSurface {
    pub fn new(store: Arc<dyn JobStore>, scheduler: Arc<Scheduler>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            scheduler,
            clock,
        }
    }

    /// Persist a new job and enqueue its first firing.
    ///
    /// If the enqueue fails the job is still persisted; the error is
    /// surfaced and safety sync repairs the dispatch on its next tick.
    pub async fn create_job(&self, owner: &str, spec: NewJob) -> Result<Job> {
        let job = self.store.create_job(owner, spec).await?;
        tracing::info!(job_id = %job.id, owner = %owner, name = %job.name, "job created");
        self.scheduler.schedule_job(&job).await?;
        Ok(job)
    }

    pub async fn get_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        self.store.get_job(owner, id).await
    }

    pub async fn list_jobs(
        &self,
        owner: &str,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>> {
        self.store.list_jobs(owner, filter, page).await
    }

    /// Apply a patch. A schedule or status change replaces the pending
    /// dispatch to match the new state.
    pub async fn update_job(&self, owner: &str, id: Uuid, patch: JobPatch) -> Result<Job> {
        let schedule_changed = patch.cron_expression.is_some();
        let status_patch = patch.status;
        let job = self.store.update_job(owner, id, patch).await?;

        match status_patch {
            Some(JobStatus::Paused) => {
                self.scheduler.cancel(job.id).await?;
            }
            _ if schedule_changed || status_patch == Some(JobStatus::Active) => {
                self.scheduler.requeue(&job).await?;
            }
            _ => {}
        }
        Ok(job)
    }

    pub async fn delete_job(&self, owner: &str, id: Uuid) -> Result<()> {
        self.store.soft_delete_job(owner, id).await?;
        // best-effort: an in-flight run continues to completion
        self.scheduler.cancel(id).await?;
        tracing::info!(job_id = %id, owner = %owner, "job deleted");
        Ok(())
    }

    pub async fn pause_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let job = self.store.pause_job(owner, id).await?;
        self.scheduler.cancel(id).await?;
        tracing::info!(job_id = %id, "job paused");
        Ok(job)
    }

    pub async fn resume_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let job = self.store.resume_job(owner, id).await?;
        self.scheduler.schedule_job(&job).await?;
        tracing::info!(job_id = %id, next_run = ?job.next_run, "job resumed");
        Ok(job)
    }

    /// Queue a manual run at elevated priority. Shares the scheduled
    /// dispatch key: a trigger during a pending scheduled run is a
    /// no-op, never a second overlapping execution.
    pub async fn trigger_job(&self, owner: &str, id: Uuid) -> Result<TriggerReceipt> {
        let job = self.store.get_job(owner, id).await?;
        self.scheduler.trigger(&job).await?;
        tracing::info!(job_id = %id, "manual trigger queued");
        Ok(TriggerReceipt { status: "queued" })
    }

    /// Jobs firing within the horizon (default 24 h), soonest first.
    pub async fn upcoming_jobs(&self, owner: &str, horizon: Option<Duration>) -> Result<Vec<Job>> {
        let horizon = horizon.unwrap_or_else(|| Duration::hours(DEFAULT_UPCOMING_HORIZON_HOURS));
        self.store
            .upcoming_jobs(owner, self.clock.now() + horizon)
            .await
    }

    pub async fn get_executions(
        &self,
        owner: &str,
        job_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Execution>> {
        self.store.list_executions(owner, job_id, page).await
    }

    pub async fn get_execution(&self, owner: &str, execution_id: Uuid) -> Result<Execution> {
        self.store.get_execution(owner, execution_id).await
    }

    pub async fn get_execution_logs(
        &self,
        owner: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>> {
        self.store.get_execution_logs(owner, execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::CoreConfig;
    use crate::errors::SchedulerError;
    use crate::metrics::CoreMetrics;
    use crate::models::{JobKind, Schedule};
    use crate::queue::{DispatchQueue, InMemoryDispatchQueue};
    use crate::store::{InMemoryJobStore, JobDefaults};
    use chrono::{TimeZone, Utc};

    struct Harness {
        clock: Arc<FakeClock>,
        queue: Arc<InMemoryDispatchQueue>,
        control: ControlSurface,
    }

    fn setup() -> Harness {
        let clock = Arc::new(FakeClock::new(
            Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 30).unwrap(),
        ));
        let store = Arc::new(InMemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let queue = Arc::new(InMemoryDispatchQueue::new(
            clock.clone(),
            std::time::Duration::from_secs(60),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            Arc::new(CoreMetrics::new()),
            &CoreConfig::default(),
        ));
        let control = ControlSurface::new(store, scheduler, clock.clone());
        Harness {
            clock,
            queue,
            control,
        }
    }

    fn recurring_spec(name: &str) -> NewJob {
        NewJob {
            name: name.to_string(),
            description: None,
            kind: JobKind::Recurring,
            schedule: Schedule::Cron("*/5 * * * *".to_string()),
            payload: serde_json::Value::Null,
            timeout_secs: Some(60),
            max_retries: Some(3),
        }
    }

    #[tokio::test]
    async fn test_create_persists_and_enqueues() {
        let h = setup();
        let job = h.control.create_job("tenant-a", recurring_spec("j")).await.unwrap();
        assert_eq!(job.status, JobStatus::Active);

        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.delayed, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_spec_without_side_effects() {
        let h = setup();
        let mut spec = recurring_spec("j");
        spec.schedule = Schedule::Cron("bogus".to_string());
        match h.control.create_job("tenant-a", spec).await.unwrap_err() {
            SchedulerError::InvalidCron(_) => {}
            other => panic!("Expected InvalidCron, got: {:?}", other),
        }
        let page = h
            .control
            .list_jobs("tenant-a", &JobFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(h.queue.depths().await.unwrap().delayed, 0);
    }

    #[tokio::test]
    async fn test_pause_cancels_dispatch_resume_requeues() {
        let h = setup();
        let job = h.control.create_job("tenant-a", recurring_spec("j")).await.unwrap();

        h.control.pause_job("tenant-a", job.id).await.unwrap();
        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.delayed + depths.waiting, 0);

        h.clock.advance(chrono::Duration::minutes(2));
        let resumed = h.control.resume_job("tenant-a", job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Active);
        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.delayed, 1);
    }

    #[tokio::test]
    async fn test_pause_resume_cycles_track_last_resume() {
        let h = setup();
        let job = h.control.create_job("tenant-a", recurring_spec("j")).await.unwrap();

        h.control.pause_job("tenant-a", job.id).await.unwrap();
        h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 12, 6, 0).unwrap());
        h.control.resume_job("tenant-a", job.id).await.unwrap();
        h.control.pause_job("tenant-a", job.id).await.unwrap();
        h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 12, 11, 0).unwrap());
        let resumed = h.control.resume_job("tenant-a", job.id).await.unwrap();

        // next_run is computed from the instant of the last resume
        assert_eq!(
            resumed.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 12, 15, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_delete_cancels_dispatch() {
        let h = setup();
        let job = h.control.create_job("tenant-a", recurring_spec("j")).await.unwrap();
        h.control.delete_job("tenant-a", job.id).await.unwrap();

        assert!(h.control.get_job("tenant-a", job.id).await.is_err());
        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.delayed + depths.waiting, 0);
    }

    #[tokio::test]
    async fn test_update_cron_replaces_dispatch() {
        let h = setup();
        let job = h.control.create_job("tenant-a", recurring_spec("j")).await.unwrap();

        let patch = JobPatch {
            cron_expression: Some("0 * * * *".to_string()),
            ..Default::default()
        };
        let updated = h.control.update_job("tenant-a", job.id, patch).await.unwrap();
        assert_eq!(
            updated.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 13, 0, 0).unwrap())
        );
        // still exactly one pending dispatch, at the new time
        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.delayed, 1);
    }

    #[tokio::test]
    async fn test_trigger_returns_queued_receipt() {
        let h = setup();
        let job = h.control.create_job("tenant-a", recurring_spec("j")).await.unwrap();
        let receipt = h.control.trigger_job("tenant-a", job.id).await.unwrap();
        assert_eq!(receipt, TriggerReceipt { status: "queued" });

        // trigger for an unknown job is owner-scoped not_found
        match h.control.trigger_job("tenant-b", job.id).await.unwrap_err() {
            SchedulerError::NotFound(_) => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upcoming_jobs_default_horizon() {
        let h = setup();
        h.control.create_job("tenant-a", recurring_spec("soon")).await.unwrap();
        let upcoming = h.control.upcoming_jobs("tenant-a", None).await.unwrap();
        assert_eq!(upcoming.len(), 1);

        let upcoming = h
            .control
            .upcoming_jobs("tenant-a", Some(Duration::seconds(1)))
            .await
            .unwrap();
        assert!(upcoming.is_empty());
    }
}
