use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::control::ControlSurface;
use crate::executor::{Executor, JobLogic};
use crate::metrics::{CoreMetrics, MetricsSnapshot};
use crate::notify::NotificationSink;
use crate::queue::{DispatchQueue, InMemoryDispatchQueue, PgDispatchQueue};
use crate::scheduler::Scheduler;
use crate::store::{InMemoryJobStore, JobDefaults, JobStore, PgJobStore};

/// A fully wired engine: store, queue, scheduler, executor, control
/// surface, metrics.
///
/// Everything is constructed once at startup and passed by reference;
/// the only process-wide state is the clock, the tracing subscriber, and
/// the connection pool, all owned here.
pub struct Engine {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DispatchQueue>,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<Executor>,
    pub control: ControlSurface,
    pub metrics: Arc<CoreMetrics>,
    pub clock: Arc<dyn Clock>,
    config: CoreConfig,
}

impl Engine {
    /// Wire the engine over in-memory backends (development, tests).
    pub fn in_memory(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        logic: Arc<dyn JobLogic>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let defaults = JobDefaults {
            timeout_secs: config.default_job_timeout_secs,
            max_retries: config.default_max_retries,
        };
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(clock.clone(), defaults));
        let queue: Arc<dyn DispatchQueue> = Arc::new(InMemoryDispatchQueue::new(
            clock.clone(),
            config.backoff_base(),
        ));
        Self::wire(config, clock, store, queue, logic, sink)
    }

    /// Wire the engine over Postgres, creating the schema if absent.
    pub async fn postgres(
        config: CoreConfig,
        database_url: &str,
        clock: Arc<dyn Clock>,
        logic: Arc<dyn JobLogic>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;

        let defaults = JobDefaults {
            timeout_secs: config.default_job_timeout_secs,
            max_retries: config.default_max_retries,
        };
        let pg_store = PgJobStore::new(pool.clone(), clock.clone(), defaults);
        pg_store
            .ensure_schema()
            .await
            .context("Failed to create job store schema")?;
        let pg_queue = PgDispatchQueue::new(pool, clock.clone(), config.backoff_base());
        pg_queue
            .ensure_schema()
            .await
            .context("Failed to create dispatch queue schema")?;

        let store: Arc<dyn JobStore> = Arc::new(pg_store);
        let queue: Arc<dyn DispatchQueue> = Arc::new(pg_queue);
        Ok(Self::wire(config, clock, store, queue, logic, sink))
    }

    fn wire(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        logic: Arc<dyn JobLogic>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let metrics = Arc::new(CoreMetrics::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            metrics.clone(),
            &config,
        ));
        let executor = Arc::new(Executor::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            logic,
            scheduler.clone(),
            sink,
            metrics.clone(),
            &config,
        ));
        let control = ControlSurface::new(store.clone(), scheduler.clone(), clock.clone());
        Self {
            store,
            queue,
            scheduler,
            executor,
            control,
            metrics,
            clock,
            config,
        }
    }

    pub async fn metrics_snapshot(&self) -> crate::errors::Result<MetricsSnapshot> {
        Ok(self.metrics.snapshot(self.queue.depths().await?))
    }

    /// Apply the retention policy once: evict finished executions and
    /// logs past their horizons and purge expired queue records.
    pub async fn run_retention_sweep(&self) -> crate::errors::Result<()> {
        let now = self.clock.now();
        let execution_horizon =
            now - chrono::Duration::days(self.config.execution_retention_days as i64);
        let log_horizon = now - chrono::Duration::days(self.config.log_retention_days as i64);

        let executions = self.store.evict_finished_executions(execution_horizon).await?;
        let logs = self.store.evict_logs(log_horizon).await?;
        let queue_records = self.queue.purge_expired().await?;
        tracing::info!(executions, logs, queue_records, "retention sweep complete");
        Ok(())
    }

    /// Run safety sync, the worker pool, and the retention sweep until
    /// `shutdown` flips. A startup sync runs immediately so work missed
    /// while the process was down is recovered without waiting a full
    /// interval.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.scheduler.run_safety_sync().await {
            tracing::error!("startup safety sync failed: {}", e);
        }

        let sync = {
            let scheduler = self.scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run_safety_sync_loop(shutdown).await })
        };

        let workers = tokio::spawn(self.executor.clone().run(shutdown.clone()));

        let sweep_interval = Duration::from_secs(self.config.retention_sweep_interval_secs);
        let mut shutdown_sweep = shutdown.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {
                    if let Err(e) = self.run_retention_sweep().await {
                        tracing::error!("retention sweep failed: {}", e);
                    }
                }
                _ = shutdown_sweep.changed() => {
                    if *shutdown_sweep.borrow() {
                        break;
                    }
                }
            }
        }

        // workers own the drain window; sync stops on the same signal
        let _ = sync.await;
        let _ = workers.await;
        tracing::info!("engine stopped");
    }

    /// Run until SIGINT/SIGTERM, then drain and stop.
    pub async fn run_until_signal(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let signals = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut term =
                    signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to install ctrl-c handler")?;
            }
            Ok::<_, anyhow::Error>(())
        };

        let run = self.run(shutdown_rx);
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => {}
            result = signals => {
                result?;
                tracing::info!("shutdown signal received, draining");
                let _ = shutdown_tx.send(true);
                run.await;
            }
        }
        Ok(())
    }
}

/// Build a default system clock for production wiring.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
