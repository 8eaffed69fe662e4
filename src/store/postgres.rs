use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::{Result, SchedulerError};
use crate::models::{
    Execution, ExecutionLog, ExecutionOutcome, ExecutionStatus, Job, JobFilter, JobKind, JobPatch,
    JobStatus, LogLevel, NewJob, Page, PageRequest, Schedule, SortField, SortOrder,
};
use crate::store::{apply_patch, build_job, JobDefaults, JobStore};

/// Bootstrap DDL. Schema migration tooling is an external collaborator;
/// this creates the layout idempotently for fresh databases and tests.
///
/// `executions` and `execution_logs` are intended to be range-partitioned
/// by month on `started_at`/`timestamp` in production; the engine only
/// relies on rows older than the retention horizon being evictable.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id               UUID PRIMARY KEY,
    owner            TEXT NOT NULL,
    name             TEXT NOT NULL,
    description      TEXT,
    kind             TEXT NOT NULL CHECK (kind IN ('one_time', 'recurring')),
    schedule_kind    TEXT NOT NULL CHECK (schedule_kind IN ('immediate', 'at', 'cron')),
    scheduled_time   TIMESTAMPTZ,
    cron_expression  TEXT,
    next_run         TIMESTAMPTZ,
    payload          JSONB NOT NULL DEFAULT 'null',
    timeout_secs     BIGINT NOT NULL CHECK (timeout_secs BETWEEN 1 AND 3600),
    max_retries      INT NOT NULL CHECK (max_retries BETWEEN 0 AND 10),
    status           TEXT NOT NULL CHECK (status IN ('pending', 'active', 'paused', 'completed', 'failed', 'deleted')),
    retry_count      INT NOT NULL DEFAULT 0,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    last_executed_at TIMESTAMPTZ,
    CHECK (
        (kind = 'recurring' AND schedule_kind = 'cron' AND cron_expression IS NOT NULL)
        OR (kind = 'one_time' AND schedule_kind = 'immediate')
        OR (kind = 'one_time' AND schedule_kind = 'at' AND scheduled_time IS NOT NULL)
    )
);

CREATE INDEX IF NOT EXISTS idx_jobs_owner_status ON jobs (owner, status);
CREATE INDEX IF NOT EXISTS idx_jobs_next_run_active ON jobs (next_run) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS executions (
    id            UUID PRIMARY KEY,
    job_id        UUID NOT NULL,
    started_at    TIMESTAMPTZ NOT NULL,
    finished_at   TIMESTAMPTZ,
    status        TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed', 'timeout')),
    retry_attempt INT NOT NULL DEFAULT 0,
    duration_ms   BIGINT,
    error_message TEXT,
    output        JSONB
);

CREATE INDEX IF NOT EXISTS idx_executions_job_started ON executions (job_id, started_at DESC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_running
    ON executions (job_id, retry_attempt) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS execution_logs (
    id           UUID PRIMARY KEY,
    execution_id UUID NOT NULL,
    level        TEXT NOT NULL CHECK (level IN ('debug', 'info', 'warning', 'error')),
    message      TEXT NOT NULL,
    timestamp    TIMESTAMPTZ NOT NULL,
    metadata     JSONB
);

CREATE INDEX IF NOT EXISTS idx_logs_execution ON execution_logs (execution_id, timestamp);
"#;

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    owner: String,
    name: String,
    description: Option<String>,
    kind: String,
    schedule_kind: String,
    scheduled_time: Option<DateTime<Utc>>,
    cron_expression: Option<String>,
    next_run: Option<DateTime<Utc>>,
    payload: Value,
    timeout_secs: i64,
    max_retries: i32,
    status: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_executed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let kind = match self.kind.as_str() {
            "one_time" => JobKind::OneTime,
            "recurring" => JobKind::Recurring,
            other => {
                return Err(SchedulerError::Internal(format!(
                    "job {} has unknown kind '{}'",
                    self.id, other
                )))
            }
        };
        let schedule = match self.schedule_kind.as_str() {
            "immediate" => Schedule::Immediate,
            "at" => Schedule::At(self.scheduled_time.ok_or_else(|| {
                SchedulerError::Internal(format!("job {} missing scheduled_time", self.id))
            })?),
            "cron" => Schedule::Cron(self.cron_expression.clone().ok_or_else(|| {
                SchedulerError::Internal(format!("job {} missing cron_expression", self.id))
            })?),
            other => {
                return Err(SchedulerError::Internal(format!(
                    "job {} has unknown schedule_kind '{}'",
                    self.id, other
                )))
            }
        };
        Ok(Job {
            id: self.id,
            owner: self.owner,
            name: self.name,
            description: self.description,
            kind,
            schedule,
            next_run: self.next_run,
            payload: self.payload,
            timeout_secs: self.timeout_secs as u64,
            max_retries: self.max_retries as u32,
            status: self.status.parse()?,
            retry_count: self.retry_count as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_executed_at: self.last_executed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    job_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: String,
    retry_attempt: i32,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    output: Option<Value>,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution> {
        let status = match self.status.as_str() {
            "running" => ExecutionStatus::Running,
            "success" => ExecutionStatus::Success,
            "failed" => ExecutionStatus::Failed,
            "timeout" => ExecutionStatus::Timeout,
            other => {
                return Err(SchedulerError::Internal(format!(
                    "execution {} has unknown status '{}'",
                    self.id, other
                )))
            }
        };
        Ok(Execution {
            id: self.id,
            job_id: self.job_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            status,
            retry_attempt: self.retry_attempt as u32,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            output: self.output,
        })
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: Uuid,
    execution_id: Uuid,
    level: String,
    message: String,
    timestamp: DateTime<Utc>,
    metadata: Option<Value>,
}

impl LogRow {
    fn into_log(self) -> Result<ExecutionLog> {
        let level = match self.level.as_str() {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            other => {
                return Err(SchedulerError::Internal(format!(
                    "log {} has unknown level '{}'",
                    self.id, other
                )))
            }
        };
        Ok(ExecutionLog {
            id: self.id,
            execution_id: self.execution_id,
            level,
            message: self.message,
            timestamp: self.timestamp,
            metadata: self.metadata,
        })
    }
}

fn schedule_columns(schedule: &Schedule) -> (&'static str, Option<DateTime<Utc>>, Option<&str>) {
    match schedule {
        Schedule::Immediate => ("immediate", None, None),
        Schedule::At(at) => ("at", Some(*at), None),
        Schedule::Cron(expr) => ("cron", None, Some(expr.as_str())),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

/// Postgres-backed job store.
pub struct PgJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    defaults: JobDefaults,
}

impl PgJobStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, defaults: JobDefaults) -> Self {
        Self {
            pool,
            clock,
            defaults,
        }
    }

    /// Create tables and indexes if absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let (schedule_kind, scheduled_time, cron_expression) = schedule_columns(&job.schedule);
        sqlx::query(
            r#"
            INSERT INTO jobs (id, owner, name, description, kind, schedule_kind,
                              scheduled_time, cron_expression, next_run, payload,
                              timeout_secs, max_retries, status, retry_count,
                              created_at, updated_at, last_executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id)
        .bind(&job.owner)
        .bind(&job.name)
        .bind(&job.description)
        .bind(match job.kind {
            JobKind::OneTime => "one_time",
            JobKind::Recurring => "recurring",
        })
        .bind(schedule_kind)
        .bind(scheduled_time)
        .bind(cron_expression)
        .bind(job.next_run)
        .bind(&job.payload)
        .bind(job.timeout_secs as i64)
        .bind(job.max_retries as i32)
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.last_executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_job<'e, E>(executor: E, job: &Job) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let (schedule_kind, scheduled_time, cron_expression) = schedule_columns(&job.schedule);
        sqlx::query(
            r#"
            UPDATE jobs
            SET name = $2, description = $3, schedule_kind = $4, scheduled_time = $5,
                cron_expression = $6, next_run = $7, payload = $8, timeout_secs = $9,
                status = $10, retry_count = $11, updated_at = $12, last_executed_at = $13
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(schedule_kind)
        .bind(scheduled_time)
        .bind(cron_expression)
        .bind(job.next_run)
        .bind(&job.payload)
        .bind(job.timeout_secs as i64)
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(job.updated_at)
        .bind(job.last_executed_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Fetch a visible (non-deleted, owner-matching) job row inside a
    /// transaction, locking it for update.
    async fn lock_visible_job(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        owner: &str,
        id: Uuid,
    ) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE id = $1 AND owner = $2 AND status <> 'deleted' FOR UPDATE",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or_else(|| SchedulerError::NotFound(format!("job {}", id)))?
            .into_job()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, owner: &str, spec: NewJob) -> Result<Job> {
        let job = build_job(owner, spec, self.defaults, self.clock.as_ref())?;
        self.insert_job(&job).await?;
        Ok(job)
    }

    async fn get_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE id = $1 AND owner = $2 AND status <> 'deleted'",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| SchedulerError::NotFound(format!("job {}", id)))?
            .into_job()
    }

    async fn list_jobs(
        &self,
        owner: &str,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>> {
        // ORDER BY fragments are fixed strings, never user input
        let order_column = match filter.sort_by.unwrap_or(SortField::CreatedAt) {
            SortField::CreatedAt => "created_at",
            SortField::NextRun => "next_run",
            SortField::Name => "name",
            SortField::UpdatedAt => "updated_at",
        };
        let order_dir = match filter.sort_order.unwrap_or(SortOrder::Desc) {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        let status = filter.status.map(|s| s.as_str());
        let kind = filter.kind.map(|k| match k {
            JobKind::OneTime => "one_time",
            JobKind::Recurring => "recurring",
        });

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE owner = $1 AND status <> 'deleted'
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR kind = $3)
            "#,
        )
        .bind(owner)
        .bind(status)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;

        let page_number = page.page.max(1);
        let offset = ((page_number - 1) * page.per_page) as i64;
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT * FROM jobs
            WHERE owner = $1 AND status <> 'deleted'
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR kind = $3)
            ORDER BY {} {}
            LIMIT $4 OFFSET $5
            "#,
            order_column, order_dir
        ))
        .bind(owner)
        .bind(status)
        .bind(kind)
        .bind(page.per_page as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: page_number,
            per_page: page.per_page,
        })
    }

    async fn update_job(&self, owner: &str, id: Uuid, patch: JobPatch) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_visible_job(&mut tx, owner, id).await?;
        apply_patch(&mut job, patch, self.clock.as_ref())?;
        Self::persist_job(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn soft_delete_job(&self, owner: &str, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_visible_job(&mut tx, owner, id).await?;
        job.status = JobStatus::Deleted;
        job.next_run = None;
        job.updated_at = self.clock.now();
        Self::persist_job(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pause_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_visible_job(&mut tx, owner, id).await?;
        if job.kind != JobKind::Recurring {
            return Err(SchedulerError::InvalidInput(
                "only recurring jobs can be paused".to_string(),
            ));
        }
        if job.status != JobStatus::Active {
            return Err(SchedulerError::ForbiddenTransition {
                from: job.status,
                to: JobStatus::Paused,
            });
        }
        job.status = JobStatus::Paused;
        job.updated_at = self.clock.now();
        Self::persist_job(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn resume_job(&self, owner: &str, id: Uuid) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_visible_job(&mut tx, owner, id).await?;
        if job.status != JobStatus::Paused {
            return Err(SchedulerError::ForbiddenTransition {
                from: job.status,
                to: JobStatus::Active,
            });
        }
        let expr = job
            .cron_expression()
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule("paused job has no cron expression".to_string())
            })?
            .to_string();
        let now = self.clock.now();
        job.status = JobStatus::Active;
        job.next_run = Some(crate::cron::next_occurrence(&expr, now)?);
        job.updated_at = now;
        Self::persist_job(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn claim_due_jobs(&self, limit: usize, horizon: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'active' AND next_run <= $1
            ORDER BY next_run ASC
            LIMIT $2
            "#,
        )
        .bind(horizon)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn upcoming_jobs(&self, owner: &str, until: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE owner = $1 AND status = 'active' AND next_run <= $2
            ORDER BY next_run ASC
            "#,
        )
        .bind(owner)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE id = $1 AND status <> 'deleted'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn begin_execution(&self, job_id: Uuid, retry_attempt: u32) -> Result<Execution> {
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
        let result = sqlx::query(
            r#"
            INSERT INTO executions (id, job_id, started_at, status, retry_attempt)
            VALUES ($1, $2, $3, 'running', $4)
            "#,
        )
        .bind(execution.id)
        .bind(execution.job_id)
        .bind(execution.started_at)
        .bind(execution.retry_attempt as i32)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(execution),
            Err(err) if is_unique_violation(&err) => Err(SchedulerError::Conflict(format!(
                "execution already running for job {} attempt {}",
                job_id, retry_attempt
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn finalize_execution(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
    ) -> Result<Execution> {
        let now = self.clock.now();
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE executions
            SET status = $2,
                finished_at = $3,
                duration_ms = (EXTRACT(EPOCH FROM ($3 - started_at)) * 1000)::BIGINT,
                error_message = $4,
                output = $5
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(execution_id)
        .bind(outcome.status().as_str())
        .bind(now)
        .bind(outcome.error_message())
        .bind(outcome.output())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_execution(),
            // terminal executions are immutable; a second finalize is a conflict
            None => Err(SchedulerError::Conflict(format!(
                "execution {} is not running",
                execution_id
            ))),
        }
    }

    async fn find_running_executions(&self, job_id: Uuid) -> Result<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE job_id = $1 AND status = 'running'",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn set_next_run(&self, job_id: Uuid, next_run: DateTime<Utc>) -> Result<()> {
        let done = sqlx::query("UPDATE jobs SET next_run = $2 WHERE id = $1")
            .bind(job_id)
            .bind(next_run)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(SchedulerError::JobGone);
        }
        Ok(())
    }

    async fn mark_last_executed(&self, job_id: Uuid) -> Result<()> {
        let now = self.clock.now();
        let done =
            sqlx::query("UPDATE jobs SET last_executed_at = $2, updated_at = $2 WHERE id = $1")
                .bind(job_id)
                .bind(now)
                .execute(&self.pool)
                .await?;
        if done.rows_affected() == 0 {
            return Err(SchedulerError::JobGone);
        }
        Ok(())
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<()> {
        self.set_job_status(job_id, JobStatus::Completed).await
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut job = row.ok_or(SchedulerError::JobGone)?.into_job()?;
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
        job.updated_at = self.clock.now();
        Self::persist_job(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn increment_retry_count(&self, job_id: Uuid) -> Result<()> {
        let done = sqlx::query(
            "UPDATE jobs SET retry_count = LEAST(retry_count + 1, max_retries) WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(SchedulerError::JobGone);
        }
        Ok(())
    }

    async fn reset_retry_count(&self, job_id: Uuid) -> Result<()> {
        let done = sqlx::query("UPDATE jobs SET retry_count = 0 WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(SchedulerError::JobGone);
        }
        Ok(())
    }

    async fn append_log(
        &self,
        execution_id: Uuid,
        level: LogLevel,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (id, execution_id, level, message, timestamp, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(level.as_str())
        .bind(message)
        .bind(self.clock.now())
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_executions(
        &self,
        owner: &str,
        job_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Execution>> {
        // executions are retained after soft-delete; only owner is checked
        let owned = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE id = $1 AND owner = $2",
        )
        .bind(job_id)
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        if owned == 0 {
            return Err(SchedulerError::NotFound(format!("job {}", job_id)));
        }

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM executions WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        let page_number = page.page.max(1);
        let offset = ((page_number - 1) * page.per_page) as i64;
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM executions
            WHERE job_id = $1
            ORDER BY started_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(job_id)
        .bind(page.per_page as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(ExecutionRow::into_execution)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: page_number,
            per_page: page.per_page,
        })
    }

    async fn get_execution(&self, owner: &str, execution_id: Uuid) -> Result<Execution> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT e.* FROM executions e
            JOIN jobs j ON j.id = e.job_id
            WHERE e.id = $1 AND j.owner = $2
            "#,
        )
        .bind(execution_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| SchedulerError::NotFound(format!("execution {}", execution_id)))?
            .into_execution()
    }

    async fn get_execution_logs(
        &self,
        owner: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>> {
        // verifies ownership through the execution's job
        self.get_execution(owner, execution_id).await?;
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT * FROM execution_logs WHERE execution_id = $1 ORDER BY timestamp ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LogRow::into_log).collect()
    }

    async fn evict_finished_executions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query(
            "DELETE FROM executions WHERE status <> 'running' AND finished_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn evict_logs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query("DELETE FROM execution_logs WHERE timestamp < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}
