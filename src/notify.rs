use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope published when a job exhausts its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailureNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub job_id: Uuid,
    pub job_name: String,
    pub owner: String,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl JobFailureNotification {
    pub fn new(
        job_id: Uuid,
        job_name: &str,
        owner: &str,
        error: &str,
        attempts: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: "job_failure".to_string(),
            job_id,
            job_name: job_name.to_string(),
            owner: owner.to_string(),
            error: error.to_string(),
            attempts,
            timestamp,
        }
    }
}

/// Terminal-failure sink. Delivery is fire-and-forget: a full or closed
/// transport drops the message rather than blocking the executor.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, notification: JobFailureNotification);
}

/// Sink feeding an in-process channel; the transport consumer (email,
/// webhook, whatever the deployment wires up) drains the receiver.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<JobFailureNotification>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<JobFailureNotification>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn emit(&self, notification: JobFailureNotification) {
        if let Err(e) = self.tx.try_send(notification) {
            tracing::warn!("dropping failure notification: {}", e);
        }
    }
}

/// Sink that only records the failure in the structured log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn emit(&self, notification: JobFailureNotification) {
        tracing::error!(
            job_id = %notification.job_id,
            job_name = %notification.job_name,
            owner = %notification.owner,
            attempts = notification.attempts,
            error = %notification.error,
            "job failed terminally"
        );
    }
}
