use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::cron;
use crate::errors::{Result, SchedulerError};

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const MAX_RETRY_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    OneTime,
    Recurring,
}

/// When a job fires. Exactly one variant per job, matching its kind:
/// `Immediate` and `At` belong to one-time jobs, `Cron` to recurring ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Schedule {
    Immediate,
    At(DateTime<Utc>),
    Cron(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Deleted,
}

impl JobStatus {
    /// Statuses that carry a populated `next_run`.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Active | JobStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "deleted" => Ok(JobStatus::Deleted),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Whether the state machine permits `from → to`.
///
/// Terminal statuses only transition to `deleted`; `deleted` is final.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    match (from, to) {
        (_, Deleted) => from != Deleted,
        (Pending, Active) => true,
        (Active, Paused) => true,
        (Paused, Active) => true,
        (Active, Active) => true,
        (Active, Completed) => true,
        (Active, Failed) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: JobKind,
    pub schedule: Schedule,
    /// Authoritative firing time. Populated while status is
    /// pending/active/paused, cleared on terminal transitions.
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default = "default_payload")]
    pub payload: Value,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
}

fn default_payload() -> Value {
    Value::Null
}

impl Job {
    /// The cron expression, when this is a recurring job.
    pub fn cron_expression(&self) -> Option<&str> {
        match &self.schedule {
            Schedule::Cron(expr) => Some(expr.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: JobKind,
    pub schedule: Schedule,
    #[serde(default = "default_payload")]
    pub payload: Value,
    /// Defaults to the configured job timeout when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Defaults to the configured retry budget when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Partial update. Only these fields are user-editable; schedule changes
/// are limited to the cron expression of recurring jobs, and status
/// changes to the active/paused pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub cron_expression: Option<String>,
    pub payload: Option<Value>,
    pub timeout_secs: Option<u64>,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedAt,
    NextRun,
    Name,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub sort_by: Option<SortField>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Validate a NewJob before creation: name, schedule/kind compatibility,
/// cron validity, and the timeout/retry bounds.
pub fn validate_new_job(job: &NewJob) -> Result<()> {
    if job.name.trim().is_empty() {
        return Err(SchedulerError::InvalidInput(
            "Job name cannot be empty".to_string(),
        ));
    }

    match (&job.kind, &job.schedule) {
        (JobKind::Recurring, Schedule::Cron(expr)) => cron::validate(expr)?,
        (JobKind::OneTime, Schedule::Immediate) | (JobKind::OneTime, Schedule::At(_)) => {}
        (JobKind::Recurring, _) => {
            return Err(SchedulerError::InvalidSchedule(
                "recurring jobs require a cron schedule".to_string(),
            ));
        }
        (JobKind::OneTime, Schedule::Cron(_)) => {
            return Err(SchedulerError::InvalidSchedule(
                "one-time jobs cannot use a cron schedule".to_string(),
            ));
        }
    }

    if let Some(timeout) = job.timeout_secs {
        validate_timeout(timeout)?;
    }
    if let Some(retries) = job.max_retries {
        validate_max_retries(retries)?;
    }

    Ok(())
}

/// Validate a JobPatch before applying.
pub fn validate_patch(patch: &JobPatch) -> Result<()> {
    if let Some(ref name) = patch.name {
        if name.trim().is_empty() {
            return Err(SchedulerError::InvalidInput(
                "Job name cannot be empty".to_string(),
            ));
        }
    }
    if let Some(ref expr) = patch.cron_expression {
        cron::validate(expr)?;
    }
    if let Some(timeout) = patch.timeout_secs {
        validate_timeout(timeout)?;
    }
    if let Some(status) = patch.status {
        if !matches!(status, JobStatus::Active | JobStatus::Paused) {
            return Err(SchedulerError::InvalidInput(format!(
                "status can only be patched to active or paused, not {}",
                status.as_str()
            )));
        }
    }
    Ok(())
}

pub fn validate_timeout(timeout_secs: u64) -> Result<()> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout_secs) {
        return Err(SchedulerError::InvalidInput(format!(
            "timeout must be within {}..={} s, got {}",
            MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS, timeout_secs
        )));
    }
    Ok(())
}

pub fn validate_max_retries(max_retries: u32) -> Result<()> {
    if max_retries > MAX_RETRY_LIMIT {
        return Err(SchedulerError::InvalidInput(format!(
            "max_retries must be within 0..={}, got {}",
            MAX_RETRY_LIMIT, max_retries
        )));
    }
    Ok(())
}

/// Compute the initial `next_run` for a schedule at creation time.
///
/// Immediate fires now; a fixed instant must still be in the future; a
/// cron expression fires at its next occurrence after now.
pub fn initial_next_run(schedule: &Schedule, clock: &dyn Clock) -> Result<DateTime<Utc>> {
    let now = clock.now();
    match schedule {
        Schedule::Immediate => Ok(now),
        Schedule::At(at) => {
            if *at < now {
                return Err(SchedulerError::ScheduledTimeInPast);
            }
            Ok(*at)
        }
        Schedule::Cron(expr) => cron::next_occurrence(expr, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use chrono::TimeZone;

    fn make_new_job() -> NewJob {
        NewJob {
            name: "nightly-report".to_string(),
            description: None,
            kind: JobKind::Recurring,
            schedule: Schedule::Cron("*/5 * * * *".to_string()),
            payload: serde_json::json!({"report": "daily"}),
            timeout_secs: Some(60),
            max_retries: Some(3),
        }
    }

    fn make_job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::now_v7(),
            owner: "tenant-a".to_string(),
            name: "nightly-report".to_string(),
            description: Some("generates the nightly report".to_string()),
            kind: JobKind::Recurring,
            schedule: Schedule::Cron("*/5 * * * *".to_string()),
            next_run: Some(now),
            payload: serde_json::json!({"k": 1}),
            timeout_secs: 60,
            max_retries: 3,
            status: JobStatus::Active,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            last_executed_at: None,
        }
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let job = make_job();
        let json = serde_json::to_string(&job).expect("serialize");
        let deserialized: Job = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(job.id, deserialized.id);
        assert_eq!(job.schedule, deserialized.schedule);
        assert_eq!(job.status, deserialized.status);
    }

    #[test]
    fn test_schedule_serde_tagged() {
        let schedule = Schedule::Cron("0 * * * *".to_string());
        let json = serde_json::to_string(&schedule).expect("serialize");
        assert!(json.contains("\"type\":\"cron\""));
        assert!(json.contains("\"value\":\"0 * * * *\""));

        let immediate = Schedule::Immediate;
        let json = serde_json::to_string(&immediate).expect("serialize");
        assert!(json.contains("\"type\":\"immediate\""));
    }

    #[test]
    fn test_status_snake_case_serde() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(
            serde_json::to_string(&JobKind::OneTime).unwrap(),
            "\"one_time\""
        );
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("paused".parse::<JobStatus>().unwrap(), JobStatus::Paused);
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_schedulable_statuses_require_next_run() {
        assert!(JobStatus::Pending.is_schedulable());
        assert!(JobStatus::Active.is_schedulable());
        assert!(JobStatus::Paused.is_schedulable());
        assert!(!JobStatus::Completed.is_schedulable());
        assert!(!JobStatus::Failed.is_schedulable());
        assert!(!JobStatus::Deleted.is_schedulable());
    }

    #[test]
    fn test_transition_matrix() {
        use JobStatus::*;
        assert!(can_transition(Pending, Active));
        assert!(can_transition(Active, Paused));
        assert!(can_transition(Paused, Active));
        assert!(can_transition(Active, Active));
        assert!(can_transition(Active, Completed));
        assert!(can_transition(Active, Failed));
        assert!(can_transition(Completed, Deleted));
        assert!(can_transition(Failed, Deleted));

        assert!(!can_transition(Completed, Active));
        assert!(!can_transition(Failed, Active));
        assert!(!can_transition(Paused, Completed));
        assert!(!can_transition(Deleted, Deleted));
        assert!(!can_transition(Deleted, Active));
    }

    #[test]
    fn test_validation_empty_name_rejected() {
        let mut job = make_new_job();
        job.name = "  ".to_string();
        let result = validate_new_job(&job);
        match result.unwrap_err() {
            SchedulerError::InvalidInput(msg) => assert!(msg.contains("empty")),
            other => panic!("Expected InvalidInput, got: {:?}", other),
        }
    }

    #[test]
    fn test_validation_kind_schedule_mismatch() {
        let mut job = make_new_job();
        job.schedule = Schedule::Immediate;
        match validate_new_job(&job).unwrap_err() {
            SchedulerError::InvalidSchedule(_) => {}
            other => panic!("Expected InvalidSchedule, got: {:?}", other),
        }

        let mut job = make_new_job();
        job.kind = JobKind::OneTime;
        match validate_new_job(&job).unwrap_err() {
            SchedulerError::InvalidSchedule(_) => {}
            other => panic!("Expected InvalidSchedule, got: {:?}", other),
        }
    }

    #[test]
    fn test_validation_invalid_cron_rejected() {
        let mut job = make_new_job();
        job.schedule = Schedule::Cron("not a cron".to_string());
        match validate_new_job(&job).unwrap_err() {
            SchedulerError::InvalidCron(_) => {}
            other => panic!("Expected InvalidCron, got: {:?}", other),
        }
    }

    #[test]
    fn test_validation_timeout_bounds() {
        let mut job = make_new_job();
        job.timeout_secs = Some(0);
        assert!(validate_new_job(&job).is_err());
        job.timeout_secs = Some(3601);
        assert!(validate_new_job(&job).is_err());
        job.timeout_secs = Some(3600);
        assert!(validate_new_job(&job).is_ok());
    }

    #[test]
    fn test_validation_retry_bounds() {
        let mut job = make_new_job();
        job.max_retries = Some(11);
        assert!(validate_new_job(&job).is_err());
        job.max_retries = Some(10);
        assert!(validate_new_job(&job).is_ok());
    }

    #[test]
    fn test_patch_status_limited_to_active_paused() {
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            ..Default::default()
        };
        assert!(validate_patch(&patch).is_err());

        let patch = JobPatch {
            status: Some(JobStatus::Paused),
            ..Default::default()
        };
        assert!(validate_patch(&patch).is_ok());
    }

    #[test]
    fn test_patch_invalid_cron_rejected() {
        let patch = JobPatch {
            cron_expression: Some("bad".to_string()),
            ..Default::default()
        };
        assert!(validate_patch(&patch).is_err());
    }

    #[test]
    fn test_initial_next_run_immediate_is_now() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let clock = FakeClock::new(now);
        let next = initial_next_run(&Schedule::Immediate, &clock).unwrap();
        assert_eq!(next, now);
    }

    #[test]
    fn test_initial_next_run_at_in_past_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let clock = FakeClock::new(now);
        let past = now - chrono::Duration::seconds(1);
        match initial_next_run(&Schedule::At(past), &clock).unwrap_err() {
            SchedulerError::ScheduledTimeInPast => {}
            other => panic!("Expected ScheduledTimeInPast, got: {:?}", other),
        }
    }

    #[test]
    fn test_initial_next_run_cron() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 2, 30).unwrap();
        let clock = FakeClock::new(now);
        let next =
            initial_next_run(&Schedule::Cron("*/5 * * * *".to_string()), &clock).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 6, 15, 12, 5, 0).unwrap();
        assert_eq!(next, expected);
    }

    #[test]
    fn test_new_job_defaults_applied_in_serde() {
        let json = r#"{"name":"j","kind":"one_time","schedule":{"type":"immediate"}}"#;
        let job: NewJob = serde_json::from_str(json).expect("deserialize");
        assert!(job.timeout_secs.is_none());
        assert!(job.max_retries.is_none());
        assert_eq!(job.payload, Value::Null);
    }
}
