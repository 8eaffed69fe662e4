use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::cron;
use crate::errors::{Result, SchedulerError};
use crate::models::{
    Execution, ExecutionLog, ExecutionOutcome, ExecutionStatus, Job, JobFilter, JobKind, JobPatch,
    JobStatus, LogLevel, NewJob, Page, PageRequest, SortField, SortOrder,
};
use crate::store::{apply_patch, build_job, JobDefaults, JobStore};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    executions: HashMap<Uuid, Execution>,
    logs: Vec<ExecutionLog>,
}

/// In-memory job store backing tests and local development.
///
/// Mirrors the Postgres backend's semantics exactly; the engine is
/// written against the `JobStore` trait alone and must not be able to
/// tell the two apart.
pub struct InMemoryJobStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    defaults: JobDefaults,
}

impl InMemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>, defaults: JobDefaults) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
            defaults,
        }
    }

    /// Number of jobs including soft-deleted rows. Test helper.
    pub async fn raw_job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    fn visible<'a>(state: &'a State, owner: &str, id: Uuid) -> Result<&'a Job> {
        match state.jobs.get(&id) {
            Some(job) if job.owner == owner && job.status != JobStatus::Deleted => Ok(job),
            _ => Err(SchedulerError::NotFound(format!("job {}", id))),
        }
    }

    /// Owner check for execution history: the job row may be soft-deleted
    /// (executions are retained for audit) but must belong to the owner.
    fn owned<'a>(state: &'a State, owner: &str, job_id: Uuid) -> Result<&'a Job> {
        match state.jobs.get(&job_id) {
            Some(job) if job.owner == owner => Ok(job),
            _ => Err(SchedulerError::NotFound(format!("job {}", job_id))),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, owner: &str, spec: NewJob) -> Result<Job> {
        let job = build_job(owner, spec, self.defaults, self.clock.as_ref())?;
        let mut state = self.state.write().await;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let state = self.state.read().await;
        Self::visible(&state, owner, id).cloned()
    }

    async fn list_jobs(
        &self,
        owner: &str,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>> {
        let state = self.state.read().await;
        let mut items: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.owner == owner && j.status != JobStatus::Deleted)
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.kind.map_or(true, |k| j.kind == k))
            .cloned()
            .collect();

        let sort_by = filter.sort_by.unwrap_or(SortField::CreatedAt);
        let sort_order = filter.sort_order.unwrap_or(SortOrder::Desc);
        items.sort_by(|a, b| {
            let ordering = match sort_by {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::NextRun => a.next_run.cmp(&b.next_run),
                SortField::Name => a.name.cmp(&b.name),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            };
            match sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = items.len() as u64;
        let start = ((page.page.max(1) - 1) * page.per_page) as usize;
        let items = items
            .into_iter()
            .skip(start)
            .take(page.per_page as usize)
            .collect();

        Ok(Page {
            items,
            total,
            page: page.page.max(1),
            per_page: page.per_page,
        })
    }

    async fn update_job(&self, owner: &str, id: Uuid, patch: JobPatch) -> Result<Job> {
        let mut state = self.state.write().await;
        Self::visible(&state, owner, id)?;
        let clock = self.clock.clone();
        let job = state.jobs.get_mut(&id).expect("checked above");
        apply_patch(job, patch, clock.as_ref())?;
        Ok(job.clone())
    }

    async fn soft_delete_job(&self, owner: &str, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        Self::visible(&state, owner, id)?;
        let now = self.clock.now();
        let job = state.jobs.get_mut(&id).expect("checked above");
        job.status = JobStatus::Deleted;
        job.next_run = None;
        job.updated_at = now;
        Ok(())
    }

    async fn pause_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let mut state = self.state.write().await;
        let current = Self::visible(&state, owner, id)?.clone();
        if current.kind != JobKind::Recurring {
            return Err(SchedulerError::InvalidInput(
                "only recurring jobs can be paused".to_string(),
            ));
        }
        if current.status != JobStatus::Active {
            return Err(SchedulerError::ForbiddenTransition {
                from: current.status,
                to: JobStatus::Paused,
            });
        }
        let now = self.clock.now();
        let job = state.jobs.get_mut(&id).expect("checked above");
        job.status = JobStatus::Paused;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn resume_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let mut state = self.state.write().await;
        let current = Self::visible(&state, owner, id)?.clone();
        if current.status != JobStatus::Paused {
            return Err(SchedulerError::ForbiddenTransition {
                from: current.status,
                to: JobStatus::Active,
            });
        }
        let expr = current
            .cron_expression()
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule("paused job has no cron expression".to_string())
            })?
            .to_string();
        let now = self.clock.now();
        let next_run = cron::next_occurrence(&expr, now)?;
        let job = state.jobs.get_mut(&id).expect("checked above");
        job.status = JobStatus::Active;
        job.next_run = Some(next_run);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn claim_due_jobs(&self, limit: usize, horizon: DateTime<Utc>) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut due: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Active)
            .filter(|j| j.next_run.map_or(false, |t| t <= horizon))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run);
        due.truncate(limit);
        Ok(due)
    }

    async fn upcoming_jobs(&self, owner: &str, until: DateTime<Utc>) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut upcoming: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.owner == owner && j.status == JobStatus::Active)
            .filter(|j| j.next_run.map_or(false, |t| t <= until))
            .cloned()
            .collect();
        upcoming.sort_by_key(|j| j.next_run);
        Ok(upcoming)
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .get(&id)
            .filter(|j| j.status != JobStatus::Deleted)
            .cloned())
    }

    async fn begin_execution(&self, job_id: Uuid, retry_attempt: u32) -> Result<Execution> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(SchedulerError::JobGone);
        }
        // natural-key guard: one running row per (job_id, retry_attempt)
        let duplicate = state.executions.values().any(|e| {
            e.job_id == job_id
                && e.retry_attempt == retry_attempt
                && e.status == ExecutionStatus::Running
        });
        if duplicate {
            return Err(SchedulerError::Conflict(format!(
                "execution already running for job {} attempt {}",
                job_id, retry_attempt
            )));
        }
        let execution = Execution {
            id: Uuid::now_v7(),
            job_id,
            started_at: self.clock.now(),
            finished_at: None,
            status: ExecutionStatus::Running,
            retry_attempt,
            duration_ms: None,
            error_message: None,
            output: None,
        };
        state.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn finalize_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
    ) -> Result<Execution> {
        let mut state = self.state.write().await;
        let now = self.clock.now();
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("execution {}", execution_id)))?;
        if execution.status != ExecutionStatus::Running {
            return Err(SchedulerError::Conflict(format!(
                "execution {} already finalized as {}",
                execution_id,
                execution.status.as_str()
            )));
        }
        execution.status = outcome.status();
        execution.finished_at = Some(now);
        execution.duration_ms = Some((now - execution.started_at).num_milliseconds());
        execution.error_message = outcome.error_message();
        execution.output = outcome.output();
        Ok(execution.clone())
    }

    async fn find_running_executions(&self, job_id: Uuid) -> Result<Vec<Execution>> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .values()
            .filter(|e| e.job_id == job_id && e.status == ExecutionStatus::Running)
            .cloned()
            .collect())
    }

    async fn set_next_run(&self, job_id: Uuid, next_run: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobGone)?;
        job.next_run = Some(next_run);
        Ok(())
    }

    async fn mark_last_executed(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let now = self.clock.now();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobGone)?;
        job.last_executed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<()> {
        self.set_job_status(job_id, JobStatus::Completed).await
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let now = self.clock.now();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobGone)?;
        if !crate::models::job::can_transition(job.status, status) {
            return Err(SchedulerError::ForbiddenTransition {
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        if !status.is_schedulable() {
            job.next_run = None;
        }
        job.updated_at = now;
        Ok(())
    }

    async fn increment_retry_count(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobGone)?;
        job.retry_count = (job.retry_count + 1).min(job.max_retries);
        Ok(())
    }

    async fn reset_retry_count(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobGone)?;
        job.retry_count = 0;
        Ok(())
    }

    async fn append_log(
        &self,
        execution_id: Uuid,
        level: LogLevel,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.executions.contains_key(&execution_id) {
            return Err(SchedulerError::NotFound(format!(
                "execution {}",
                execution_id
            )));
        }
        let log = ExecutionLog {
            id: Uuid::now_v7(),
            execution_id,
            level,
            message: message.to_string(),
            timestamp: self.clock.now(),
            metadata,
        };
        state.logs.push(log);
        Ok(())
    }

    async fn list_executions(
        &self,
        owner: &str,
        job_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Execution>> {
        let state = self.state.read().await;
        Self::owned(&state, owner, job_id)?;
        let mut items: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let total = items.len() as u64;
        let start = ((page.page.max(1) - 1) * page.per_page) as usize;
        let items = items
            .into_iter()
            .skip(start)
            .take(page.per_page as usize)
            .collect();

        Ok(Page {
            items,
            total,
            page: page.page.max(1),
            per_page: page.per_page,
        })
    }

    async fn get_execution(&self, owner: &str, execution_id: Uuid) -> Result<Execution> {
        let state = self.state.read().await;
        let execution = state
            .executions
            .get(&execution_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("execution {}", execution_id)))?;
        Self::owned(&state, owner, execution.job_id)?;
        Ok(execution.clone())
    }

    async fn get_execution_logs(
        &self,
        owner: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>> {
        let state = self.state.read().await;
        let execution = state
            .executions
            .get(&execution_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("execution {}", execution_id)))?;
        Self::owned(&state, owner, execution.job_id)?;
        let mut logs: Vec<ExecutionLog> = state
            .logs
            .iter()
            .filter(|l| l.execution_id == execution_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.timestamp);
        Ok(logs)
    }

    async fn evict_finished_executions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.executions.len();
        state.executions.retain(|_, e| {
            !(e.status.is_terminal() && e.finished_at.map_or(false, |t| t < older_than))
        });
        Ok((before - state.executions.len()) as u64)
    }

    async fn evict_logs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.logs.len();
        state.logs.retain(|l| l.timestamp >= older_than);
        Ok((before - state.logs.len()) as u64)
    }
}
