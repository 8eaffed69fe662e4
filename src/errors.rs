use thiserror::Error;

use crate::models::JobStatus;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Scheduled time is in the past")]
    ScheduledTimeInPast,

    #[error("Schedule has no future match")]
    UnsatisfiableSchedule,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden transition from {from:?} to {to:?}")]
    ForbiddenTransition { from: JobStatus, to: JobStatus },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job no longer exists")]
    JobGone,

    #[error("Execution timeout after {0} s")]
    ExecutionTimeout(u64),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// The wire-level error kind exposed on the control surface.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::InvalidInput(_) => "invalid_input",
            SchedulerError::InvalidSchedule(_) => "invalid_schedule",
            SchedulerError::InvalidCron(_) => "invalid_cron",
            SchedulerError::ScheduledTimeInPast => "scheduled_time_in_past",
            SchedulerError::UnsatisfiableSchedule => "invalid_schedule",
            SchedulerError::NotFound(_) => "not_found",
            SchedulerError::ForbiddenTransition { .. } => "forbidden_transition",
            SchedulerError::Conflict(_) => "conflict",
            SchedulerError::JobGone => "not_found",
            SchedulerError::ExecutionTimeout(_) => "internal",
            SchedulerError::StoreUnavailable(_) => "internal",
            SchedulerError::QueueUnavailable(_) => "internal",
            SchedulerError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::InvalidInput(err.to_string())
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SchedulerError::NotFound("row not found".to_string()),
            other => SchedulerError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
