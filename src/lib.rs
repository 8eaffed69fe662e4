//! chronoq — a durable, multi-tenant job scheduling and execution engine.
//!
//! Three subsystems form the core:
//!
//! - the **job store** ([`store::JobStore`]), the authoritative record of
//!   jobs, executions, and logs;
//! - the **dispatch queue** ([`queue::DispatchQueue`]), a persistent
//!   timer-driven queue with idempotent enqueue by job id and
//!   exponential-backoff retry;
//! - the **scheduler** and **executor** ([`scheduler::Scheduler`],
//!   [`executor::Executor`]): lifecycle-event-to-queue translation, the
//!   periodic safety sync, and the worker pool that runs jobs under a
//!   deadline, records outcomes, reschedules recurring work, and emits
//!   terminal-failure notifications.
//!
//! Production deployments wire Postgres backends; tests and local
//! development use the in-memory ones. The engine is written against the
//! backend traits alone.

pub mod clock;
pub mod config;
pub mod control;
pub mod cron;
pub mod daemon;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::CoreConfig;
pub use control::ControlSurface;
pub use daemon::Engine;
pub use errors::{Result, SchedulerError};
pub use executor::{ExecutionContext, ExecutionLogger, Executor, JobLogic};
pub use metrics::{CoreMetrics, MetricsSnapshot};
pub use notify::{ChannelSink, JobFailureNotification, LogSink, NotificationSink};
pub use scheduler::{Rescheduler, Scheduler, SyncReport};
