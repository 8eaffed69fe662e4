use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SchedulerError};

/// Process-scoped engine configuration, read once at startup.
///
/// Every field has a serde default so a partial config file works, and
/// `from_env` overlays the documented environment variables on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Seconds between safety-sync reconciliation passes.
    #[serde(default = "default_safety_sync_interval_secs")]
    pub safety_sync_interval_secs: u64,

    /// Concurrent executions per worker process.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Dispatch items a worker may start per rate window.
    #[serde(default = "default_worker_rate_limit")]
    pub worker_rate_limit: u32,

    /// Length of the worker rate window in seconds.
    #[serde(default = "default_worker_rate_window_secs")]
    pub worker_rate_window_secs: u64,

    /// Timeout applied to jobs that do not specify one, in seconds.
    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,

    /// Retry budget applied to jobs that do not specify one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Base delay for exponential retry backoff, in seconds.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Finished executions older than this many days may be evicted.
    #[serde(default = "default_execution_retention_days")]
    pub execution_retention_days: u32,

    /// Execution logs older than this many days may be evicted.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    /// How long a worker waits for in-flight executions on shutdown.
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,

    /// Worker poll interval when the queue is empty, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Random jitter added to the poll interval, in milliseconds.
    #[serde(default = "default_poll_jitter_ms")]
    pub poll_jitter_ms: u64,

    /// Seconds between retention sweep passes.
    #[serde(default = "default_retention_sweep_interval_secs")]
    pub retention_sweep_interval_secs: u64,
}

fn default_safety_sync_interval_secs() -> u64 {
    300
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_worker_rate_limit() -> u32 {
    100
}

fn default_worker_rate_window_secs() -> u64 {
    60
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_execution_retention_days() -> u32 {
    90
}

fn default_log_retention_days() -> u32 {
    30
}

fn default_shutdown_drain_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_jitter_ms() -> u64 {
    250
}

fn default_retention_sweep_interval_secs() -> u64 {
    3600
}

impl Default for CoreConfig {
    fn default() -> Self {
        // serde_json round-trip of an empty object picks up every default fn
        serde_json::from_str("{}").expect("defaults are infallible")
    }
}

impl CoreConfig {
    /// Build a config from defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = read_env_u64("SAFETY_SYNC_INTERVAL")? {
            config.safety_sync_interval_secs = v;
        }
        if let Some(v) = read_env_u64("WORKER_CONCURRENCY")? {
            config.worker_concurrency = v as usize;
        }
        if let Some(v) = read_env_u64("WORKER_RATE_LIMIT")? {
            config.worker_rate_limit = v as u32;
        }
        if let Some(v) = read_env_u64("DEFAULT_JOB_TIMEOUT")? {
            config.default_job_timeout_secs = v;
        }
        if let Some(v) = read_env_u64("DEFAULT_MAX_RETRIES")? {
            config.default_max_retries = v as u32;
        }
        if let Some(v) = read_env_u64("BACKOFF_BASE")? {
            config.backoff_base_secs = v;
        }
        if let Some(v) = read_env_u64("EXECUTION_RETENTION_DAYS")? {
            config.execution_retention_days = v as u32;
        }
        if let Some(v) = read_env_u64("LOG_RETENTION_DAYS")? {
            config.log_retention_days = v as u32;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every bound; returns the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            return Err(SchedulerError::InvalidInput(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.safety_sync_interval_secs == 0 {
            return Err(SchedulerError::InvalidInput(
                "safety_sync_interval must be at least 1 s".to_string(),
            ));
        }
        if !(1..=3600).contains(&self.default_job_timeout_secs) {
            return Err(SchedulerError::InvalidInput(
                "default_job_timeout must be within 1..=3600 s".to_string(),
            ));
        }
        if self.default_max_retries > 10 {
            return Err(SchedulerError::InvalidInput(
                "default_max_retries must be within 0..=10".to_string(),
            ));
        }
        if self.backoff_base_secs == 0 {
            return Err(SchedulerError::InvalidInput(
                "backoff_base must be at least 1 s".to_string(),
            ));
        }
        Ok(())
    }

    pub fn safety_sync_interval(&self) -> Duration {
        Duration::from_secs(self.safety_sync_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }
}

fn read_env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => {
            let parsed = raw.trim().parse::<u64>().map_err(|_| {
                SchedulerError::InvalidInput(format!("{} must be an integer, got '{}'", name, raw))
            })?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
