use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::Job;

/// Denormalized job snapshot carried on a dispatch item.
///
/// Enough to start work without a store read, but the executor always
/// re-reads the authoritative job row before running: the envelope may be
/// stale if the job was edited between enqueue and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchEnvelope {
    pub job_id: Uuid,
    pub job_name: String,
    pub owner: String,
    pub payload: Value,
    pub timeout_secs: u64,
    /// Bypasses the `status = active` gate and runs at priority 1.
    #[serde(default)]
    pub manual: bool,
}

impl DispatchEnvelope {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            owner: job.owner.clone(),
            payload: job.payload.clone(),
            timeout_secs: job.timeout_secs,
            manual: false,
        }
    }

    pub fn manual_from_job(job: &Job) -> Self {
        Self {
            manual: true,
            ..Self::from_job(job)
        }
    }
}
