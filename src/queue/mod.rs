pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::DispatchEnvelope;

pub use memory::InMemoryDispatchQueue;
pub use postgres::PgDispatchQueue;

/// Priority for manually triggered runs; scheduled work uses 0.
pub const MANUAL_PRIORITY: i16 = 1;
pub const SCHEDULED_PRIORITY: i16 = 0;

/// Completed dispatch records are kept 24 h, at most this many.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 3600);
pub const COMPLETED_KEEP_MAX: usize = 100;
/// Dead-lettered records are kept 7 d, at most this many.
pub const DEAD_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
pub const DEAD_KEEP_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A dispatch for this job already exists in delayed/waiting/active.
    AlreadyEnqueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The item will be redelivered after backoff.
    Rescheduled { deliver_at: DateTime<Utc> },
    /// Retry budget exhausted; the item moved to the dead-letter sink.
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// Scheduled for a future instant.
    Delayed,
    /// Due but not yet claimed by a worker.
    Waiting,
    /// Claimed by a worker, under a visibility deadline.
    Active,
    Completed,
    Dead,
}

/// A claimed queue entry handed to a worker.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub id: Uuid,
    pub job_id: Uuid,
    pub envelope: DispatchEnvelope,
    /// Delivery attempt, 1-based. `attempt - 1` is the execution's
    /// `retry_attempt`.
    pub attempt: u32,
    /// Total deliveries allowed (the job's `max_retries + 1`).
    pub max_attempts: u32,
    pub priority: i16,
}

/// Queue depth by state, for load-shedding decisions upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub delayed: u64,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub dead: u64,
}

/// Persistent timer-driven queue keyed by job id.
///
/// `enqueue` is idempotent by job id over the live states: this is the
/// single mechanism preventing double-scheduling races between the
/// scheduler and safety sync. Delivery is at-least-once; items claimed
/// by a crashed worker return to waiting when their visibility deadline
/// expires.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(
        &self,
        envelope: DispatchEnvelope,
        delay: Duration,
        priority: i16,
        max_attempts: u32,
    ) -> Result<EnqueueOutcome>;

    /// Remove a pending (delayed/waiting) item. Succeeds whether or not
    /// one was present; an active item is left to finish.
    async fn remove(&self, job_id: Uuid) -> Result<()>;

    /// Claim the next due item, highest priority first. `None` when
    /// nothing is due.
    async fn dequeue(&self) -> Result<Option<DispatchItem>>;

    async fn complete(&self, item: &DispatchItem) -> Result<()>;

    /// Report a failed delivery. Unless final, reschedules with
    /// exponential backoff; otherwise dead-letters the item.
    async fn fail(&self, item: &DispatchItem, error: &str, is_final: bool) -> Result<FailOutcome>;

    async fn depths(&self) -> Result<QueueDepths>;

    /// Apply the retention policy to completed/dead records. Returns the
    /// number of records purged.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Exponential backoff before redelivering attempt `attempt + 1`:
/// `base * 2^(attempt - 1)` for the attempt that just failed.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}
