use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// One attempt to run a job. Created `running` by the executor, finalized
/// exactly once, immutable afterwards. Rows outlive their job (audit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// 0 for the first try, 1..max_retries for subsequent retries.
    pub retry_attempt: u32,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub output: Option<Value>,
}

/// Terminal result reported by the executor when a run finishes.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success { output: Option<Value> },
    Failed { error: String },
    Timeout { timeout_secs: u64 },
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Success { .. } => ExecutionStatus::Success,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
            ExecutionOutcome::Timeout { .. } => ExecutionStatus::Timeout,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::Failed { error } => Some(error.clone()),
            ExecutionOutcome::Timeout { timeout_secs } => {
                Some(format!("execution timeout after {} s", timeout_secs))
            }
        }
    }

    pub fn output(&self) -> Option<Value> {
        match self {
            ExecutionOutcome::Success { output } => output.clone(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Append-only log line bound for life to one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}
