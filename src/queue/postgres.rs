use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::{Result, SchedulerError};
use crate::models::DispatchEnvelope;
use crate::queue::{
    backoff_delay, DispatchItem, DispatchQueue, EnqueueOutcome, FailOutcome, QueueDepths,
    COMPLETED_KEEP_MAX, COMPLETED_RETENTION, DEAD_KEEP_MAX, DEAD_RETENTION,
};

/// Bootstrap DDL for the dispatch table.
///
/// The partial unique index on `job_id` over live states is the
/// idempotent-enqueue mechanism; `waiting` is not a stored state, it is a
/// `delayed` row whose `deliver_at` has passed.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dispatch_queue (
    id                  UUID PRIMARY KEY,
    job_id              UUID NOT NULL,
    envelope            JSONB NOT NULL,
    state               TEXT NOT NULL CHECK (state IN ('delayed', 'active', 'completed', 'dead')),
    priority            SMALLINT NOT NULL DEFAULT 0,
    attempt             INT NOT NULL DEFAULT 0,
    max_attempts        INT NOT NULL,
    deliver_at          TIMESTAMPTZ NOT NULL,
    visibility_deadline TIMESTAMPTZ,
    last_error          TEXT,
    enqueued_at         TIMESTAMPTZ NOT NULL,
    finished_at         TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_dispatch_live_job
    ON dispatch_queue (job_id) WHERE state IN ('delayed', 'active');
CREATE INDEX IF NOT EXISTS idx_dispatch_due
    ON dispatch_queue (priority DESC, deliver_at ASC) WHERE state = 'delayed';
"#;

#[derive(Debug, FromRow)]
struct DispatchRow {
    id: Uuid,
    job_id: Uuid,
    envelope: Value,
    attempt: i32,
    max_attempts: i32,
    priority: i16,
}

impl DispatchRow {
    fn into_item(self) -> Result<DispatchItem> {
        let envelope: DispatchEnvelope = serde_json::from_value(self.envelope)
            .map_err(|e| SchedulerError::Internal(format!("corrupt dispatch envelope: {}", e)))?;
        Ok(DispatchItem {
            id: self.id,
            job_id: self.job_id,
            envelope,
            attempt: self.attempt as u32,
            max_attempts: self.max_attempts as u32,
            priority: self.priority,
        })
    }
}

/// Postgres-backed dispatch queue.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never
/// contend on the same row; a claim that is never reported back is
/// reclaimed once its visibility deadline passes.
pub struct PgDispatchQueue {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    backoff_base: Duration,
    visibility_timeout: Duration,
}

impl PgDispatchQueue {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, backoff_base: Duration) -> Self {
        Self {
            pool,
            clock,
            backoff_base,
            visibility_timeout: Duration::from_secs(3900),
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Create the dispatch table and indexes if absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for PgDispatchQueue {
    async fn enqueue(
        &self,
        envelope: DispatchEnvelope,
        delay: Duration,
        priority: i16,
        max_attempts: u32,
    ) -> Result<EnqueueOutcome> {
        let now = self.clock.now();
        let deliver_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let envelope_json = serde_json::to_value(&envelope)
            .map_err(|e| SchedulerError::Internal(format!("envelope serialization: {}", e)))?;

        let done = sqlx::query(
            r#"
            INSERT INTO dispatch_queue
                (id, job_id, envelope, state, priority, attempt, max_attempts,
                 deliver_at, enqueued_at)
            VALUES ($1, $2, $3, 'delayed', $4, 0, $5, $6, $7)
            ON CONFLICT (job_id) WHERE state IN ('delayed', 'active') DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(envelope.job_id)
        .bind(envelope_json)
        .bind(priority)
        .bind(max_attempts.max(1) as i32)
        .bind(deliver_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;

        if done.rows_affected() == 0 {
            Ok(EnqueueOutcome::AlreadyEnqueued)
        } else {
            Ok(EnqueueOutcome::Enqueued)
        }
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM dispatch_queue WHERE job_id = $1 AND state = 'delayed'")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<DispatchItem>> {
        let now = self.clock.now();
        let deadline =
            now + chrono::Duration::from_std(self.visibility_timeout).unwrap_or_else(|_| chrono::Duration::zero());

        // due delayed rows and expired-visibility actives are claimed the
        // same way; SKIP LOCKED keeps concurrent workers off each other
        let row = sqlx::query_as::<_, DispatchRow>(
            r#"
            UPDATE dispatch_queue q
            SET state = 'active', attempt = q.attempt + 1, visibility_deadline = $2
            FROM (
                SELECT id FROM dispatch_queue
                WHERE (state = 'delayed' AND deliver_at <= $1)
                   OR (state = 'active' AND visibility_deadline <= $1)
                ORDER BY priority DESC, deliver_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ) due
            WHERE q.id = due.id
            RETURNING q.id, q.job_id, q.envelope, q.attempt, q.max_attempts, q.priority
            "#,
        )
        .bind(now)
        .bind(deadline)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;

        row.map(DispatchRow::into_item).transpose()
    }

    async fn complete(&self, item: &DispatchItem) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET state = 'completed', visibility_deadline = NULL, finished_at = $2
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(item.id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn fail(&self, item: &DispatchItem, error: &str, is_final: bool) -> Result<FailOutcome> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;

        let row = sqlx::query_as::<_, DispatchRow>(
            r#"
            SELECT id, job_id, envelope, attempt, max_attempts, priority
            FROM dispatch_queue
            WHERE id = $1 AND state = 'active'
            FOR UPDATE
            "#,
        )
        .bind(item.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;

        let Some(row) = row else {
            // the row was removed or reclaimed out from under us
            return Ok(FailOutcome::DeadLettered);
        };

        let attempt = row.attempt as u32;
        let max_attempts = row.max_attempts as u32;

        let outcome = if is_final || attempt >= max_attempts {
            sqlx::query(
                r#"
                UPDATE dispatch_queue
                SET state = 'dead', visibility_deadline = NULL,
                    last_error = $2, finished_at = $3
                WHERE id = $1
                "#,
            )
            .bind(item.id)
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;
            FailOutcome::DeadLettered
        } else {
            let delay = backoff_delay(self.backoff_base, attempt);
            let deliver_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            sqlx::query(
                r#"
                UPDATE dispatch_queue
                SET state = 'delayed', visibility_deadline = NULL,
                    deliver_at = $2, last_error = $3
                WHERE id = $1
                "#,
            )
            .bind(item.id)
            .bind(deliver_at)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;
            FailOutcome::Rescheduled { deliver_at }
        };

        tx.commit()
            .await
            .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;
        Ok(outcome)
    }

    async fn depths(&self) -> Result<QueueDepths> {
        let now = self.clock.now();
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT CASE
                     WHEN state = 'delayed' AND deliver_at <= $1 THEN 'waiting'
                     ELSE state
                   END AS bucket,
                   COUNT(*)
            FROM dispatch_queue
            GROUP BY bucket
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;

        let mut depths = QueueDepths::default();
        for (bucket, count) in rows {
            let count = count as u64;
            match bucket.as_str() {
                "delayed" => depths.delayed = count,
                "waiting" => depths.waiting = count,
                "active" => depths.active = count,
                "completed" => depths.completed = count,
                "dead" => depths.dead = count,
                _ => {}
            }
        }
        Ok(depths)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let completed_cutoff =
            now - chrono::Duration::from_std(COMPLETED_RETENTION).unwrap_or_else(|_| chrono::Duration::zero());
        let dead_cutoff = now - chrono::Duration::from_std(DEAD_RETENTION).unwrap_or_else(|_| chrono::Duration::zero());

        let mut purged = 0u64;
        for (state, cutoff, keep) in [
            ("completed", completed_cutoff, COMPLETED_KEEP_MAX as i64),
            ("dead", dead_cutoff, DEAD_KEEP_MAX as i64),
        ] {
            let done = sqlx::query(
                r#"
                DELETE FROM dispatch_queue
                WHERE state = $1
                  AND (finished_at < $2
                       OR id NOT IN (
                           SELECT id FROM dispatch_queue
                           WHERE state = $1
                           ORDER BY finished_at DESC
                           LIMIT $3
                       ))
                "#,
            )
            .bind(state)
            .bind(cutoff)
            .bind(keep)
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::QueueUnavailable(e.to_string()))?;
            purged += done.rows_affected();
        }
        Ok(purged)
    }
}
