pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::cron;
use crate::errors::{Result, SchedulerError};
use crate::models::job::{initial_next_run, validate_new_job, validate_patch};
use crate::models::{
    Execution, ExecutionLog, ExecutionOutcome, Job, JobFilter, JobKind, JobPatch, JobStatus,
    LogLevel, NewJob, Page, PageRequest,
};

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

/// Fallbacks applied to jobs created without explicit timeout/retry values.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_retries: 3,
        }
    }
}

/// Durable record of all jobs, executions, and logs.
///
/// Owner-scoped operations never see other tenants' rows or soft-deleted
/// jobs. Executor-facing operations (`begin_execution` onward) address
/// jobs by id alone. `claim_due_jobs` is a non-locking read: duplicate
/// enqueue between scheduler and safety sync is prevented by the dispatch
/// queue's idempotency key, not by a store-level lock.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, owner: &str, spec: NewJob) -> Result<Job>;
    async fn get_job(&self, owner: &str, id: Uuid) -> Result<Job>;
    async fn list_jobs(
        &self,
        owner: &str,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>>;
    async fn update_job(&self, owner: &str, id: Uuid, patch: JobPatch) -> Result<Job>;
    async fn soft_delete_job(&self, owner: &str, id: Uuid) -> Result<()>;
    async fn pause_job(&self, owner: &str, id: Uuid) -> Result<Job>;
    async fn resume_job(&self, owner: &str, id: Uuid) -> Result<Job>;

    /// Jobs with `status = active` and `next_run <= horizon`, ordered by
    /// `next_run` ascending, at most `limit`. Used by safety sync.
    async fn claim_due_jobs(&self, limit: usize, horizon: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Jobs for one owner firing within the horizon, soonest first.
    async fn upcoming_jobs(&self, owner: &str, until: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Fetch a job by id alone; `None` when absent or soft-deleted.
    async fn load_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn begin_execution(&self, job_id: Uuid, retry_attempt: u32) -> Result<Execution>;
    async fn finalize_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
    ) -> Result<Execution>;
    async fn find_running_executions(&self, job_id: Uuid) -> Result<Vec<Execution>>;

    async fn set_next_run(&self, job_id: Uuid, next_run: DateTime<Utc>) -> Result<()>;
    async fn mark_last_executed(&self, job_id: Uuid) -> Result<()>;
    async fn mark_completed(&self, job_id: Uuid) -> Result<()>;
    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;
    async fn increment_retry_count(&self, job_id: Uuid) -> Result<()>;
    async fn reset_retry_count(&self, job_id: Uuid) -> Result<()>;

    async fn append_log(
        &self,
        execution_id: Uuid,
        level: LogLevel,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()>;

    async fn list_executions(
        &self,
        owner: &str,
        job_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Execution>>;
    async fn get_execution(&self, owner: &str, execution_id: Uuid) -> Result<Execution>;
    async fn get_execution_logs(&self, owner: &str, execution_id: Uuid)
        -> Result<Vec<ExecutionLog>>;

    /// Delete finished executions older than the horizon. Returns rows removed.
    async fn evict_finished_executions(&self, older_than: DateTime<Utc>) -> Result<u64>;
    /// Delete logs older than the horizon. Returns rows removed.
    async fn evict_logs(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Build an insert-ready Job from a creation spec.
///
/// Validates the spec, applies defaults, and computes the initial
/// `next_run`. Shared by every backend so creation semantics cannot
/// drift between them.
pub fn build_job(
    owner: &str,
    spec: NewJob,
    defaults: JobDefaults,
    clock: &dyn Clock,
) -> Result<Job> {
    if owner.trim().is_empty() {
        return Err(SchedulerError::InvalidInput(
            "owner cannot be empty".to_string(),
        ));
    }
    validate_new_job(&spec)?;

    let next_run = initial_next_run(&spec.schedule, clock)?;
    let now = clock.now();

    Ok(Job {
        id: Uuid::now_v7(),
        owner: owner.to_string(),
        name: spec.name,
        description: spec.description,
        kind: spec.kind,
        schedule: spec.schedule,
        next_run: Some(next_run),
        payload: spec.payload,
        timeout_secs: spec.timeout_secs.unwrap_or(defaults.timeout_secs),
        max_retries: spec.max_retries.unwrap_or(defaults.max_retries),
        status: JobStatus::Active,
        retry_count: 0,
        created_at: now,
        updated_at: now,
        last_executed_at: None,
    })
}

/// Apply a validated patch to a job in place.
///
/// Rejects patches on terminal/deleted jobs and cron changes on one-time
/// jobs; a cron change recomputes `next_run` from the current instant.
/// Status patches follow the pause/resume rules: only recurring jobs can
/// be paused, and paused → active recomputes `next_run` like a resume.
pub fn apply_patch(job: &mut Job, patch: JobPatch, clock: &dyn Clock) -> Result<()> {
    validate_patch(&patch)?;

    if job.status == JobStatus::Completed || job.status == JobStatus::Deleted {
        return Err(SchedulerError::ForbiddenTransition {
            from: job.status,
            to: patch.status.unwrap_or(job.status),
        });
    }

    if let Some(expr) = &patch.cron_expression {
        if job.kind != JobKind::Recurring {
            return Err(SchedulerError::InvalidSchedule(
                "only recurring jobs carry a cron expression".to_string(),
            ));
        }
        job.next_run = Some(cron::next_occurrence(expr, clock.now())?);
        job.schedule = crate::models::Schedule::Cron(expr.clone());
    }

    if let Some(name) = patch.name {
        job.name = name;
    }
    if let Some(description) = patch.description {
        job.description = description;
    }
    if let Some(payload) = patch.payload {
        job.payload = payload;
    }
    if let Some(timeout) = patch.timeout_secs {
        job.timeout_secs = timeout;
    }
    if let Some(status) = patch.status {
        if !crate::models::job::can_transition(job.status, status) {
            return Err(SchedulerError::ForbiddenTransition {
                from: job.status,
                to: status,
            });
        }
        if status == JobStatus::Paused && job.kind != JobKind::Recurring {
            return Err(SchedulerError::InvalidInput(
                "only recurring jobs can be paused".to_string(),
            ));
        }
        // reactivating a paused job is a resume: next_run restarts from
        // the current instant, never from a stale past occurrence
        if job.status == JobStatus::Paused && status == JobStatus::Active {
            let expr = job.cron_expression().ok_or_else(|| {
                SchedulerError::InvalidSchedule("paused job has no cron expression".to_string())
            })?;
            let next_run = cron::next_occurrence(expr, clock.now())?;
            job.next_run = Some(next_run);
        }
        job.status = status;
    }

    job.updated_at = clock.now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::models::Schedule;
    use chrono::TimeZone;

    fn fixed_clock() -> FakeClock {
        FakeClock::new(Utc.with_ymd_and_hms(2025, 6, 15, 12, 2, 30).unwrap())
    }

    fn recurring_spec() -> NewJob {
        NewJob {
            name: "rollup".to_string(),
            description: None,
            kind: JobKind::Recurring,
            schedule: Schedule::Cron("*/5 * * * *".to_string()),
            payload: Value::Null,
            timeout_secs: None,
            max_retries: None,
        }
    }

    #[test]
    fn test_build_job_applies_defaults() {
        let clock = fixed_clock();
        let job = build_job("tenant-a", recurring_spec(), JobDefaults::default(), &clock).unwrap();
        assert_eq!(job.timeout_secs, 300);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.retry_count, 0);
        assert_eq!(
            job.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 12, 5, 0).unwrap())
        );
    }

    #[test]
    fn test_build_job_rejects_empty_owner() {
        let clock = fixed_clock();
        let result = build_job("", recurring_spec(), JobDefaults::default(), &clock);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_job_rejects_past_at() {
        let clock = fixed_clock();
        let spec = NewJob {
            kind: JobKind::OneTime,
            schedule: Schedule::At(clock.now() - chrono::Duration::seconds(1)),
            ..recurring_spec()
        };
        match build_job("tenant-a", spec, JobDefaults::default(), &clock).unwrap_err() {
            SchedulerError::ScheduledTimeInPast => {}
            other => panic!("Expected ScheduledTimeInPast, got: {:?}", other),
        }
    }

    #[test]
    fn test_apply_patch_cron_recomputes_next_run() {
        let clock = fixed_clock();
        let mut job =
            build_job("tenant-a", recurring_spec(), JobDefaults::default(), &clock).unwrap();
        let patch = JobPatch {
            cron_expression: Some("0 * * * *".to_string()),
            ..Default::default()
        };
        apply_patch(&mut job, patch, &clock).unwrap();
        assert_eq!(
            job.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 13, 0, 0).unwrap())
        );
        assert_eq!(job.schedule, Schedule::Cron("0 * * * *".to_string()));
    }

    #[test]
    fn test_apply_patch_rejects_completed_job() {
        let clock = fixed_clock();
        let mut job =
            build_job("tenant-a", recurring_spec(), JobDefaults::default(), &clock).unwrap();
        job.status = JobStatus::Completed;
        let patch = JobPatch {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        match apply_patch(&mut job, patch, &clock).unwrap_err() {
            SchedulerError::ForbiddenTransition { .. } => {}
            other => panic!("Expected ForbiddenTransition, got: {:?}", other),
        }
    }

    #[test]
    fn test_apply_patch_rejects_cron_on_one_time() {
        let clock = fixed_clock();
        let spec = NewJob {
            kind: JobKind::OneTime,
            schedule: Schedule::Immediate,
            ..recurring_spec()
        };
        let mut job = build_job("tenant-a", spec, JobDefaults::default(), &clock).unwrap();
        let patch = JobPatch {
            cron_expression: Some("* * * * *".to_string()),
            ..Default::default()
        };
        assert!(apply_patch(&mut job, patch, &clock).is_err());
    }

    #[test]
    fn test_apply_patch_pause_via_status() {
        let clock = fixed_clock();
        let mut job =
            build_job("tenant-a", recurring_spec(), JobDefaults::default(), &clock).unwrap();
        let patch = JobPatch {
            status: Some(JobStatus::Paused),
            ..Default::default()
        };
        apply_patch(&mut job, patch, &clock).unwrap();
        assert_eq!(job.status, JobStatus::Paused);
    }

    #[test]
    fn test_apply_patch_rejects_pause_on_one_time() {
        let clock = fixed_clock();
        let spec = NewJob {
            kind: JobKind::OneTime,
            schedule: Schedule::At(clock.now() + chrono::Duration::hours(1)),
            ..recurring_spec()
        };
        let mut job = build_job("tenant-a", spec, JobDefaults::default(), &clock).unwrap();
        let patch = JobPatch {
            status: Some(JobStatus::Paused),
            ..Default::default()
        };
        match apply_patch(&mut job, patch, &clock).unwrap_err() {
            SchedulerError::InvalidInput(msg) => assert!(msg.contains("recurring")),
            other => panic!("Expected InvalidInput, got: {:?}", other),
        }
        assert_eq!(job.status, JobStatus::Active, "no state change on rejection");
    }

    #[test]
    fn test_apply_patch_resume_via_status_recomputes_next_run() {
        let clock = fixed_clock();
        let mut job =
            build_job("tenant-a", recurring_spec(), JobDefaults::default(), &clock).unwrap();
        let patch = JobPatch {
            status: Some(JobStatus::Paused),
            ..Default::default()
        };
        apply_patch(&mut job, patch, &clock).unwrap();

        // several cron windows pass while paused
        clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 13, 42, 0).unwrap());
        let patch = JobPatch {
            status: Some(JobStatus::Active),
            ..Default::default()
        };
        apply_patch(&mut job, patch, &clock).unwrap();
        assert_eq!(job.status, JobStatus::Active);
        // next occurrence from the resume instant, not the stale 12:05
        assert_eq!(
            job.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 13, 45, 0).unwrap())
        );
    }
}
