use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::cron;
use crate::errors::{Result, SchedulerError};
use crate::metrics::CoreMetrics;
use crate::models::{
    Execution, ExecutionOutcome, Job, JobKind, JobStatus, LogLevel,
};
use crate::notify::{JobFailureNotification, NotificationSink};
use crate::queue::{DispatchItem, DispatchQueue, FailOutcome};
use crate::scheduler::Rescheduler;
use crate::store::JobStore;

/// Handle job logic uses to append lines to its execution's log.
pub struct ExecutionLogger {
    store: Arc<dyn JobStore>,
    execution_id: Uuid,
}

impl ExecutionLogger {
    pub fn new(store: Arc<dyn JobStore>, execution_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    /// Append a log line. Logging failures are swallowed: a flaky log
    /// write must not fail the job.
    pub async fn log(&self, level: LogLevel, message: &str, metadata: Option<Value>) {
        if let Err(e) = self
            .store
            .append_log(self.execution_id, level, message, metadata)
            .await
        {
            tracing::warn!(execution_id = %self.execution_id, "log append failed: {}", e);
        }
    }

    pub async fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, None).await;
    }

    pub async fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, None).await;
    }
}

/// Everything handed to job logic besides the job row itself.
pub struct ExecutionContext {
    pub execution: Execution,
    pub clock: Arc<dyn Clock>,
    pub logger: ExecutionLogger,
}

/// The pluggable work a job performs. The engine only provides the
/// container: invocation, deadline, result capture, retry.
#[async_trait]
pub trait JobLogic: Send + Sync {
    async fn run(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<Option<Value>>;
}

/// Sliding-window intake limiter for the worker loop.
struct RateLimiter {
    limit: u32,
    window: Duration,
    state: tokio::sync::Mutex<(tokio::time::Instant, u32)>,
}

impl RateLimiter {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: tokio::sync::Mutex::new((tokio::time::Instant::now(), 0)),
        }
    }

    /// Wait until the current window has room for one more item.
    async fn acquire(&self) {
        loop {
            let sleep_until = {
                let mut state = self.state.lock().await;
                let now = tokio::time::Instant::now();
                if now.duration_since(state.0) >= self.window {
                    *state = (now, 0);
                }
                if state.1 < self.limit {
                    state.1 += 1;
                    return;
                }
                state.0 + self.window
            };
            tokio::time::sleep_until(sleep_until).await;
        }
    }
}

/// Worker pool: claims dispatch items and drives each through the
/// execution lifecycle under a bounded concurrency budget.
pub struct Executor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    clock: Arc<dyn Clock>,
    logic: Arc<dyn JobLogic>,
    rescheduler: Arc<dyn Rescheduler>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<CoreMetrics>,
    semaphore: Arc<Semaphore>,
    rate_limiter: RateLimiter,
    poll_interval: Duration,
    poll_jitter: Duration,
    drain: Duration,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        clock: Arc<dyn Clock>,
        logic: Arc<dyn JobLogic>,
        rescheduler: Arc<dyn Rescheduler>,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<CoreMetrics>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            logic,
            rescheduler,
            sink,
            metrics,
            semaphore: Arc::new(Semaphore::new(config.worker_concurrency)),
            rate_limiter: RateLimiter::new(
                config.worker_rate_limit,
                Duration::from_secs(config.worker_rate_window_secs),
            ),
            poll_interval: config.poll_interval(),
            poll_jitter: config.poll_jitter(),
            drain: config.shutdown_drain(),
        }
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.poll_jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Main worker loop. On shutdown: stops claiming new items, waits up
    /// to the drain period for in-flight executions, then aborts them.
    /// Aborted runs leave `running` rows that the next delivery of the
    /// same job closes as `worker_shutdown`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // reap finished executions without blocking
            while tasks.try_join_next().is_some() {}

            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore never closed")
                }
                _ = shutdown.changed() => continue,
            };

            match self.queue.dequeue().await {
                Ok(Some(item)) => {
                    // rate window charges started executions, not polls
                    self.rate_limiter.acquire().await;
                    let executor = self.clone();
                    tasks.spawn(async move {
                        executor.process_item(item).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    let sleep = self.sleep_duration_with_jitter();
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!("dequeue failed: {}", e);
                    tokio::time::sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }

        tracing::info!(
            in_flight = tasks.len(),
            drain_secs = self.drain.as_secs(),
            "worker draining"
        );
        let drained = tokio::time::timeout(self.drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                aborted = tasks.len(),
                "drain period expired, aborting in-flight executions"
            );
            tasks.abort_all();
        }
    }

    /// Drive one delivered item through the execution lifecycle.
    pub async fn process_item(&self, item: DispatchItem) {
        if let Err(e) = self.try_process_item(&item).await {
            // transient backend failure: abort this step, leave the item
            // to the queue's redelivery
            tracing::error!(job_id = %item.job_id, "execution aborted: {}", e);
        }
    }

    async fn try_process_item(&self, item: &DispatchItem) -> Result<()> {
        let retry_attempt = item.attempt.saturating_sub(1);

        // the envelope may be stale; the store row is authoritative
        let Some(job) = self.store.load_job(item.job_id).await? else {
            tracing::info!(job_id = %item.job_id, "skipped: job_gone");
            CoreMetrics::incr(&self.metrics.executions_skipped);
            self.queue.complete(item).await?;
            return Ok(());
        };

        // close rows orphaned by a crashed/aborted worker. Redelivery
        // only happens after the visibility deadline, which exceeds the
        // maximum job timeout, so any running row seen here is dead.
        for orphan in self.store.find_running_executions(job.id).await? {
            tracing::warn!(
                execution_id = %orphan.id,
                job_id = %job.id,
                "closing orphaned execution as worker_shutdown"
            );
            self.store
                .finalize_execution(
                    orphan.id,
                    &ExecutionOutcome::Failed {
                        error: "worker_shutdown".to_string(),
                    },
                )
                .await?;
        }

        if job.status != JobStatus::Active && !item.envelope.manual {
            tracing::info!(job_id = %job.id, status = job.status.as_str(), "skipped: not active");
            CoreMetrics::incr(&self.metrics.executions_skipped);
            self.queue.complete(item).await?;
            return Ok(());
        }

        let execution = self.store.begin_execution(job.id, retry_attempt).await?;
        let execution_id = execution.id;
        let logger = ExecutionLogger::new(self.store.clone(), execution_id);
        logger
            .log(
                LogLevel::Info,
                "started",
                Some(serde_json::json!({ "retry_attempt": retry_attempt })),
            )
            .await;

        let outcome = self.run_with_deadline(&job, execution).await;

        match outcome {
            ExecutionOutcome::Success { .. } => {
                self.handle_success(item, &job, execution_id, outcome).await
            }
            _ => {
                self.handle_failure(item, &job, execution_id, outcome, retry_attempt)
                    .await
            }
        }
    }

    /// Run the job logic under the job's hard deadline. The timeout
    /// drops the future, which cancels the work; panics are captured and
    /// count as failures.
    async fn run_with_deadline(&self, job: &Job, execution: Execution) -> ExecutionOutcome {
        let execution_id = execution.id;
        let ctx = ExecutionContext {
            execution,
            clock: self.clock.clone(),
            logger: ExecutionLogger::new(self.store.clone(), execution_id),
        };
        let work = AssertUnwindSafe(self.logic.run(job, &ctx)).catch_unwind();

        match tokio::time::timeout(Duration::from_secs(job.timeout_secs), work).await {
            Ok(Ok(Ok(output))) => ExecutionOutcome::Success { output },
            Ok(Ok(Err(error))) => ExecutionOutcome::Failed {
                error: error.to_string(),
            },
            Ok(Err(panic)) => ExecutionOutcome::Failed {
                error: format!("job logic panicked: {}", panic_message(&panic)),
            },
            Err(_) => ExecutionOutcome::Timeout {
                timeout_secs: job.timeout_secs,
            },
        }
    }

    async fn handle_success(
        &self,
        item: &DispatchItem,
        job: &Job,
        execution_id: Uuid,
        outcome: ExecutionOutcome,
    ) -> Result<()> {
        self.store.finalize_execution(execution_id, &outcome).await?;
        self.store.reset_retry_count(job.id).await?;
        self.store.mark_last_executed(job.id).await?;
        CoreMetrics::incr(&self.metrics.executions_succeeded);

        // free the dispatch key before rescheduling, or the idempotent
        // enqueue would see the old item still live
        self.queue.complete(item).await?;

        match job.kind {
            JobKind::OneTime => {
                self.store.mark_completed(job.id).await?;
                tracing::info!(job_id = %job.id, "one-time job completed");
            }
            JobKind::Recurring => {
                // re-read: the job may have been paused or deleted mid-run
                let Some(current) = self.store.load_job(job.id).await? else {
                    return Ok(());
                };
                if current.status != JobStatus::Active {
                    tracing::info!(
                        job_id = %job.id,
                        status = current.status.as_str(),
                        "recurring job not rescheduled"
                    );
                    return Ok(());
                }
                let expr = current.cron_expression().ok_or_else(|| {
                    SchedulerError::InvalidSchedule(
                        "recurring job lost its cron expression".to_string(),
                    )
                })?;
                let next_run = cron::next_occurrence(expr, self.clock.now())?;
                self.store.set_next_run(job.id, next_run).await?;
                let mut updated = current;
                updated.next_run = Some(next_run);
                self.rescheduler.reschedule(&updated).await?;
                tracing::info!(job_id = %job.id, %next_run, "recurring job rescheduled");
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        item: &DispatchItem,
        job: &Job,
        execution_id: Uuid,
        outcome: ExecutionOutcome,
        retry_attempt: u32,
    ) -> Result<()> {
        let error = outcome
            .error_message()
            .unwrap_or_else(|| "unknown error".to_string());

        self.store.finalize_execution(execution_id, &outcome).await?;
        self.store.increment_retry_count(job.id).await?;

        match outcome {
            ExecutionOutcome::Timeout { .. } => {
                CoreMetrics::incr(&self.metrics.executions_timed_out)
            }
            _ => CoreMetrics::incr(&self.metrics.executions_failed),
        }

        let is_final = retry_attempt >= job.max_retries;
        let fail_outcome = self.queue.fail(item, &error, is_final).await?;

        match fail_outcome {
            FailOutcome::Rescheduled { deliver_at } => {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = item.attempt,
                    %deliver_at,
                    "execution failed, retry scheduled: {}",
                    error
                );
            }
            FailOutcome::DeadLettered => {
                tracing::error!(
                    job_id = %job.id,
                    attempts = item.attempt,
                    "retries exhausted: {}",
                    error
                );
                // best-effort: a manual run of a paused job has no
                // failed transition, but the notification still goes out
                if let Err(e) = self.store.set_job_status(job.id, JobStatus::Failed).await {
                    tracing::warn!(job_id = %job.id, "could not mark job failed: {}", e);
                }
                self.sink
                    .emit(JobFailureNotification::new(
                        job.id,
                        &job.name,
                        &job.owner,
                        &error,
                        retry_attempt + 1,
                        self.clock.now(),
                    ))
                    .await;
                CoreMetrics::incr(&self.metrics.notifications_emitted);
            }
        }
        Ok(())
    }

}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::models::{ExecutionStatus, NewJob, PageRequest, Schedule};
    use crate::notify::ChannelSink;
    use crate::queue::{EnqueueOutcome, InMemoryDispatchQueue};
    use crate::scheduler::Scheduler;
    use crate::store::{InMemoryJobStore, JobDefaults};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted job logic: fails the first `fail_times` runs, then
    /// succeeds; optionally sleeps to trip the deadline.
    struct ScriptedLogic {
        fail_times: u32,
        calls: AtomicU32,
        sleep: Option<Duration>,
        panic: bool,
    }

    impl ScriptedLogic {
        fn succeeding() -> Self {
            Self {
                fail_times: 0,
                calls: AtomicU32::new(0),
                sleep: None,
                panic: false,
            }
        }

        fn failing_forever() -> Self {
            Self {
                fail_times: u32::MAX,
                calls: AtomicU32::new(0),
                sleep: None,
                panic: false,
            }
        }

        fn failing_first(fail_times: u32) -> Self {
            Self {
                fail_times,
                calls: AtomicU32::new(0),
                sleep: None,
                panic: false,
            }
        }

        fn sleeping(duration: Duration) -> Self {
            Self {
                fail_times: 0,
                calls: AtomicU32::new(0),
                sleep: Some(duration),
                panic: false,
            }
        }

        fn panicking() -> Self {
            Self {
                fail_times: 0,
                calls: AtomicU32::new(0),
                sleep: None,
                panic: true,
            }
        }
    }

    #[async_trait]
    impl JobLogic for ScriptedLogic {
        async fn run(
            &self,
            _job: &Job,
            ctx: &ExecutionContext,
        ) -> anyhow::Result<Option<Value>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.logger.info("working").await;
            if self.panic {
                panic!("scripted panic");
            }
            if let Some(duration) = self.sleep {
                tokio::time::sleep(duration).await;
            }
            if call < self.fail_times {
                anyhow::bail!("scripted failure #{}", call + 1);
            }
            Ok(Some(serde_json::json!({"call": call})))
        }
    }

    struct Harness {
        clock: Arc<FakeClock>,
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryDispatchQueue>,
        scheduler: Arc<Scheduler>,
        executor: Arc<Executor>,
        notifications: tokio::sync::mpsc::Receiver<JobFailureNotification>,
    }

    fn setup(logic: ScriptedLogic) -> Harness {
        let mut config = CoreConfig::default();
        config.backoff_base_secs = 1;

        let clock = Arc::new(FakeClock::new(
            Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 30).unwrap(),
        ));
        let store = Arc::new(InMemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let queue = Arc::new(InMemoryDispatchQueue::new(
            clock.clone(),
            Duration::from_secs(1),
        ));
        let metrics = Arc::new(CoreMetrics::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            metrics.clone(),
            &config,
        ));
        let (sink, notifications) = ChannelSink::new(16);
        let executor = Arc::new(Executor::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            Arc::new(logic),
            scheduler.clone(),
            Arc::new(sink),
            metrics,
            &config,
        ));
        Harness {
            clock,
            store,
            queue,
            scheduler,
            executor,
            notifications,
        }
    }

    fn one_time_spec() -> NewJob {
        NewJob {
            name: "once".to_string(),
            description: None,
            kind: JobKind::OneTime,
            schedule: Schedule::Immediate,
            payload: serde_json::json!({"k": 1}),
            timeout_secs: Some(2),
            max_retries: Some(0),
        }
    }

    fn recurring_spec() -> NewJob {
        NewJob {
            name: "every-minute".to_string(),
            description: None,
            kind: JobKind::Recurring,
            schedule: Schedule::Cron("*/1 * * * *".to_string()),
            payload: Value::Null,
            timeout_secs: Some(2),
            max_retries: Some(2),
        }
    }

    async fn dispatch_once(h: &Harness) -> DispatchItem {
        h.queue.dequeue().await.unwrap().expect("item due")
    }

    #[tokio::test]
    async fn test_one_time_success_completes_job() {
        let mut h = setup(ScriptedLogic::succeeding());
        let job = h.store.create_job("tenant-a", one_time_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();

        let item = dispatch_once(&h).await;
        h.executor.process_item(item).await;

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(executions.items.len(), 1);
        assert_eq!(executions.items[0].status, ExecutionStatus::Success);
        assert_eq!(executions.items[0].retry_attempt, 0);
        assert!(executions.items[0].output.is_some());

        // job moved to completed, next_run cleared, nothing re-enqueued
        let filter = crate::models::JobFilter {
            status: Some(JobStatus::Completed),
            ..Default::default()
        };
        let page = h
            .store
            .list_jobs("tenant-a", &filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.items[0].next_run.is_none());
        assert!(h.queue.dequeue().await.unwrap().is_none());
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recurring_success_reschedules() {
        let h = setup(ScriptedLogic::succeeding());
        let job = h.store.create_job("tenant-a", recurring_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();

        // due at 12:01:00
        h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 12, 1, 0).unwrap());
        let item = dispatch_once(&h).await;
        h.executor.process_item(item).await;

        let current = h.store.get_job("tenant-a", job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Active);
        assert_eq!(
            current.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 15, 12, 2, 0).unwrap())
        );
        assert_eq!(current.last_executed_at, Some(h.clock.now()));

        // next dispatch is delayed until 12:02:00
        assert!(h.queue.dequeue().await.unwrap().is_none());
        h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 12, 2, 0).unwrap());
        let item = dispatch_once(&h).await;
        assert_eq!(item.job_id, job.id);
    }

    #[tokio::test]
    async fn test_job_gone_skips_without_execution_row() {
        let h = setup(ScriptedLogic::succeeding());
        let job = h.store.create_job("tenant-a", one_time_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();
        let item = dispatch_once(&h).await;

        // deleted while the dispatch was in flight
        h.store.soft_delete_job("tenant-a", job.id).await.unwrap();
        h.executor.process_item(item).await;

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert!(executions.items.is_empty());
        // completed on the queue, no retry
        assert!(h.queue.dequeue().await.unwrap().is_none());
        assert_eq!(h.queue.depths().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_paused_job_skipped_unless_manual() {
        let h = setup(ScriptedLogic::succeeding());
        let job = h.store.create_job("tenant-a", recurring_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();
        h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 12, 1, 0).unwrap());
        let item = dispatch_once(&h).await;

        h.store.pause_job("tenant-a", job.id).await.unwrap();
        h.executor.process_item(item).await;
        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert!(executions.items.is_empty());

        // manual trigger bypasses the status gate
        let paused = h.store.get_job("tenant-a", job.id).await.unwrap();
        assert_eq!(
            h.scheduler.trigger(&paused).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        let item = dispatch_once(&h).await;
        assert!(item.envelope.manual);
        h.executor.process_item(item).await;
        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(executions.items.len(), 1);
        assert_eq!(executions.items[0].status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_timeout_consumes_retry_and_is_final_when_budget_spent() {
        let mut h = setup(ScriptedLogic::sleeping(Duration::from_secs(30)));
        let job = h.store.create_job("tenant-a", one_time_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();
        let item = dispatch_once(&h).await;

        tokio::time::pause();
        h.executor.process_item(item).await;
        tokio::time::resume();

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(executions.items.len(), 1);
        assert_eq!(executions.items[0].status, ExecutionStatus::Timeout);
        assert_eq!(
            executions.items[0].error_message.as_deref(),
            Some("execution timeout after 2 s")
        );

        // max_retries = 0: straight to failed + one notification
        let filter = crate::models::JobFilter {
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        let page = h
            .store
            .list_jobs("tenant-a", &filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        let notification = h.notifications.recv().await.unwrap();
        assert_eq!(notification.attempts, 1);
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_then_retry_then_success() {
        let mut h = setup(ScriptedLogic::failing_first(2));
        let spec = NewJob {
            max_retries: Some(3),
            ..recurring_spec()
        };
        let job = h.store.create_job("tenant-a", spec).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();

        // attempt 1 at 12:01:00 fails; backoff base 1 s
        h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 12, 1, 0).unwrap());
        let item = dispatch_once(&h).await;
        h.executor.process_item(item).await;

        // attempt 2 at +1 s fails
        h.clock.advance(chrono::Duration::seconds(1));
        let item = dispatch_once(&h).await;
        assert_eq!(item.attempt, 2);
        h.executor.process_item(item).await;

        // attempt 3 at +2 s more succeeds
        h.clock.advance(chrono::Duration::seconds(2));
        let item = dispatch_once(&h).await;
        assert_eq!(item.attempt, 3);
        h.executor.process_item(item).await;

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(executions.items.len(), 3);
        let mut attempts: Vec<u32> = executions.items.iter().map(|e| e.retry_attempt).collect();
        attempts.sort_unstable();
        assert_eq!(attempts, vec![0, 1, 2]);
        // newest first: the successful third attempt
        assert_eq!(executions.items[0].status, ExecutionStatus::Success);

        let current = h.store.get_job("tenant-a", job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Active);
        assert_eq!(current.retry_count, 0, "reset on success");
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_job_and_notifies_once() {
        let mut h = setup(ScriptedLogic::failing_forever());
        let job = h.store.create_job("tenant-a", recurring_spec()).await.unwrap();
        assert_eq!(job.max_retries, 2);
        h.scheduler.schedule_job(&job).await.unwrap();

        h.clock.set(Utc.with_ymd_and_hms(2025, 6, 15, 12, 1, 0).unwrap());
        for _ in 0..3 {
            let item = dispatch_once(&h).await;
            h.executor.process_item(item).await;
            h.clock.advance(chrono::Duration::seconds(10));
        }

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(executions.items.len(), 3);
        assert!(executions
            .items
            .iter()
            .all(|e| e.status == ExecutionStatus::Failed));

        let filter = crate::models::JobFilter {
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        let page = h
            .store
            .list_jobs("tenant-a", &filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.items[0].next_run.is_none());

        let notification = h.notifications.recv().await.unwrap();
        assert_eq!(notification.attempts, 3);
        assert_eq!(notification.owner, "tenant-a");
        assert!(h.notifications.try_recv().is_err(), "exactly one notification");
        // nothing left in the queue
        assert!(h.queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let h = setup(ScriptedLogic::panicking());
        let job = h.store.create_job("tenant-a", one_time_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();
        let item = dispatch_once(&h).await;
        h.executor.process_item(item).await;

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(executions.items.len(), 1);
        assert_eq!(executions.items[0].status, ExecutionStatus::Failed);
        assert!(executions.items[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("panicked"));
    }

    #[tokio::test]
    async fn test_orphaned_running_row_closed_on_redelivery() {
        let h = setup(ScriptedLogic::succeeding());
        let job = h.store.create_job("tenant-a", one_time_spec()).await.unwrap();
        // simulate a crashed worker: running row with no finalize
        let orphan = h.store.begin_execution(job.id, 0).await.unwrap();

        h.scheduler.schedule_job(&job).await.unwrap();
        let item = dispatch_once(&h).await;
        h.executor.process_item(item).await;

        let closed = h.store.get_execution("tenant-a", orphan.id).await.unwrap();
        assert_eq!(closed.status, ExecutionStatus::Failed);
        assert_eq!(closed.error_message.as_deref(), Some("worker_shutdown"));

        // the fresh attempt ran to success afterwards
        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert!(executions
            .items
            .iter()
            .any(|e| e.status == ExecutionStatus::Success));
    }

    #[tokio::test]
    async fn test_execution_logs_written_in_order() {
        let h = setup(ScriptedLogic::succeeding());
        let job = h.store.create_job("tenant-a", one_time_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();
        let item = dispatch_once(&h).await;
        h.executor.process_item(item).await;

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        let logs = h
            .store
            .get_execution_logs("tenant-a", executions.items[0].id)
            .await
            .unwrap();
        assert_eq!(logs[0].message, "started");
        assert_eq!(logs[1].message, "working");
    }

    #[tokio::test]
    async fn test_worker_loop_drains_on_shutdown() {
        let h = setup(ScriptedLogic::succeeding());
        let job = h.store.create_job("tenant-a", one_time_spec()).await.unwrap();
        h.scheduler.schedule_job(&job).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.executor.clone().run(shutdown_rx));

        // give the loop a moment to claim and run the job
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker loop exits after shutdown")
            .unwrap();

        let executions = h
            .store
            .list_executions("tenant-a", job.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(executions.items.len(), 1);
        assert_eq!(executions.items[0].status, ExecutionStatus::Success);
    }
}
