use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::Result;
use crate::models::DispatchEnvelope;
use crate::queue::{
    backoff_delay, DispatchItem, DispatchQueue, EnqueueOutcome, FailOutcome, QueueDepths,
    COMPLETED_KEEP_MAX, COMPLETED_RETENTION, DEAD_KEEP_MAX, DEAD_RETENTION,
};

struct LiveEntry {
    id: Uuid,
    envelope: DispatchEnvelope,
    deliver_at: DateTime<Utc>,
    /// Deliveries so far; incremented when a worker claims the entry.
    attempt: u32,
    max_attempts: u32,
    priority: i16,
    active: bool,
    visibility_deadline: Option<DateTime<Utc>>,
    /// Kept for forensics; surfaced only through logs.
    #[allow(dead_code)]
    last_error: Option<String>,
}

struct HistoryEntry {
    job_id: Uuid,
    finished_at: DateTime<Utc>,
    #[allow(dead_code)]
    attempts: u32,
    #[allow(dead_code)]
    error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    live: HashMap<Uuid, LiveEntry>,
    completed: VecDeque<HistoryEntry>,
    dead: VecDeque<HistoryEntry>,
}

/// In-memory dispatch queue for tests and local development.
///
/// Claimed items carry a visibility deadline; if the worker never reports
/// back (crash, abort) the entry returns to waiting on the next dequeue
/// pass, preserving at-least-once delivery.
pub struct InMemoryDispatchQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    backoff_base: Duration,
    visibility_timeout: Duration,
}

impl InMemoryDispatchQueue {
    pub fn new(clock: Arc<dyn Clock>, backoff_base: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            backoff_base,
            // comfortably above the maximum job timeout so a long run is
            // never redelivered mid-flight
            visibility_timeout: Duration::from_secs(3900),
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    fn reclaim_expired(state: &mut QueueState, now: DateTime<Utc>) {
        for entry in state.live.values_mut() {
            if entry.active {
                if let Some(deadline) = entry.visibility_deadline {
                    if deadline <= now {
                        tracing::warn!(
                            job_id = %entry.envelope.job_id,
                            attempt = entry.attempt,
                            "dispatch visibility deadline expired, returning to waiting"
                        );
                        entry.active = false;
                        entry.visibility_deadline = None;
                        entry.deliver_at = now;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(
        &self,
        envelope: DispatchEnvelope,
        delay: Duration,
        priority: i16,
        max_attempts: u32,
    ) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        let job_id = envelope.job_id;
        if state.live.contains_key(&job_id) {
            return Ok(EnqueueOutcome::AlreadyEnqueued);
        }
        let now = self.clock.now();
        let deliver_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        state.live.insert(
            job_id,
            LiveEntry {
                id: Uuid::now_v7(),
                envelope,
                deliver_at,
                attempt: 0,
                max_attempts: max_attempts.max(1),
                priority,
                active: false,
                visibility_deadline: None,
                last_error: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.live.get(&job_id) {
            if !entry.active {
                state.live.remove(&job_id);
            }
        }
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<DispatchItem>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        Self::reclaim_expired(&mut state, now);

        let candidate = state
            .live
            .values()
            .filter(|e| !e.active && e.deliver_at <= now)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.deliver_at.cmp(&a.deliver_at))
            })
            .map(|e| e.envelope.job_id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let visibility_timeout =
            chrono::Duration::from_std(self.visibility_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let entry = state.live.get_mut(&job_id).expect("candidate exists");
        entry.active = true;
        entry.attempt += 1;
        entry.visibility_deadline = Some(now + visibility_timeout);

        Ok(Some(DispatchItem {
            id: entry.id,
            job_id,
            envelope: entry.envelope.clone(),
            attempt: entry.attempt,
            max_attempts: entry.max_attempts,
            priority: entry.priority,
        }))
    }

    async fn complete(&self, item: &DispatchItem) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.live.remove(&item.job_id) {
            state.completed.push_back(HistoryEntry {
                job_id: item.job_id,
                finished_at: self.clock.now(),
                attempts: entry.attempt,
                error: None,
            });
        }
        Ok(())
    }

    async fn fail(&self, item: &DispatchItem, error: &str, is_final: bool) -> Result<FailOutcome> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let Some(entry) = state.live.get_mut(&item.job_id) else {
            // already removed (pause/delete raced the failure); treat as dead
            return Ok(FailOutcome::DeadLettered);
        };

        if is_final || entry.attempt >= entry.max_attempts {
            let entry = state.live.remove(&item.job_id).expect("checked above");
            state.dead.push_back(HistoryEntry {
                job_id: item.job_id,
                finished_at: now,
                attempts: entry.attempt,
                error: Some(error.to_string()),
            });
            return Ok(FailOutcome::DeadLettered);
        }

        let delay = backoff_delay(self.backoff_base, entry.attempt);
        let deliver_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        entry.active = false;
        entry.visibility_deadline = None;
        entry.deliver_at = deliver_at;
        entry.last_error = Some(error.to_string());
        Ok(FailOutcome::Rescheduled { deliver_at })
    }

    async fn depths(&self) -> Result<QueueDepths> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let mut depths = QueueDepths {
            completed: state.completed.len() as u64,
            dead: state.dead.len() as u64,
            ..Default::default()
        };
        for entry in state.live.values() {
            if entry.active {
                depths.active += 1;
            } else if entry.deliver_at <= now {
                depths.waiting += 1;
            } else {
                depths.delayed += 1;
            }
        }
        Ok(depths)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let mut purged = 0u64;

        let completed_cutoff =
            now - chrono::Duration::from_std(COMPLETED_RETENTION).unwrap_or_else(|_| chrono::Duration::zero());
        let dead_cutoff = now - chrono::Duration::from_std(DEAD_RETENTION).unwrap_or_else(|_| chrono::Duration::zero());

        let before = state.completed.len();
        state.completed.retain(|e| e.finished_at >= completed_cutoff);
        while state.completed.len() > COMPLETED_KEEP_MAX {
            state.completed.pop_front();
        }
        purged += (before - state.completed.len()) as u64;

        let before = state.dead.len();
        state.dead.retain(|e| e.finished_at >= dead_cutoff);
        while state.dead.len() > DEAD_KEEP_MAX {
            state.dead.pop_front();
        }
        purged += (before - state.dead.len()) as u64;

        Ok(purged)
    }
}
