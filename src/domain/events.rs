//! Event types for the per-job event log.
//!
//! Every state change of a job is recorded as an immutable event in an
//! append-only log, so a job's outcome can be inspected after the process
//! exits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::Stage;

/// A single event in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The job this event belongs to
    pub job_id: Uuid,

    /// Stage the event refers to (if applicable)
    pub stage: Option<Stage>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{job_id}:{stage}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Attempt number within the stage (1-indexed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for completed stages)
    pub duration_ms: Option<u64>,

    /// Error code and message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        job_id: Uuid,
        stage: Option<Stage>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            job_id,
            stage,
            event_type,
            idempotency_key,
            payload_summary,
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A job was accepted at intake
    JobStarted,

    /// All required stages succeeded
    JobCompleted,

    /// A local video exists but publishing did not complete
    JobPartial,

    /// A stage failed fatally
    JobFailed,

    /// The job was cancelled at a stage boundary
    JobCancelled,

    /// A stage attempt began
    StageStarted,

    /// A stage produced its artifact
    StageCompleted,

    /// A stage attempt failed and will be retried
    StageRetrying,

    /// A stage failed with no retries left
    StageFailed,

    /// Publish credentials were refreshed after an auth failure
    CredentialsRefreshed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some(Stage::Generating),
            EventType::StageStarted,
            "test-key".to_string(),
            "Starting generating stage".to_string(),
        )
        .with_attempt(1);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StageStarted);
        assert_eq!(parsed.stage, Some(Stage::Generating));
        assert_eq!(parsed.attempt, Some(1));
        assert!(json.contains("\"stage_started\""));
    }

    #[test]
    fn test_event_with_error() {
        let event = Event::new(
            Uuid::new_v4(),
            Some(Stage::Publishing),
            EventType::StageFailed,
            "test-key".to_string(),
            "Publishing failed".to_string(),
        )
        .with_duration(1500)
        .with_error("upload_rejected: bad title".to_string());

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("upload_rejected: bad title"));
    }
}
