//! Job state machine and intake/result types.
//!
//! A Job is one production run. It is owned by the orchestrator; stages only
//! ever see `&Job`. The status moves strictly forward:
//!
//! `pending → resolving → generating → synthesizing → composing → publishing → done`
//!
//! `failed` is reachable from any non-terminal state, `partial` only from
//! `publishing` (a local video exists but the upload did not complete).

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::{AudioArtifact, PublishResult, ScriptArtifact, VideoArtifact};
use crate::error::{ErrorClass, PipelineError, PipelineResult};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolving,
    Generating,
    Synthesizing,
    Composing,
    Publishing,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Resolving,
        Stage::Generating,
        Stage::Synthesizing,
        Stage::Composing,
        Stage::Publishing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::Generating => "generating",
            Self::Synthesizing => "synthesizing",
            Self::Composing => "composing",
            Self::Publishing => "publishing",
        }
    }

    /// The job status while this stage runs
    pub fn status(self) -> JobStatus {
        match self {
            Self::Resolving => JobStatus::Resolving,
            Self::Generating => JobStatus::Generating,
            Self::Synthesizing => JobStatus::Synthesizing,
            Self::Composing => JobStatus::Composing,
            Self::Publishing => JobStatus::Publishing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Resolving,
    Generating,
    Synthesizing,
    Composing,
    Publishing,
    Done,
    Failed,
    Partial,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Generating => "generating",
            Self::Synthesizing => "synthesizing",
            Self::Composing => "composing",
            Self::Publishing => "publishing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Partial)
    }

    /// Position in the forward order; terminal states share the last rank
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Resolving => 1,
            Self::Generating => 2,
            Self::Synthesizing => 3,
            Self::Composing => 4,
            Self::Publishing => 5,
            Self::Done | Self::Failed | Self::Partial => 6,
        }
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Self::Failed => true,
            Self::Partial => self == Self::Publishing,
            Self::Done => matches!(self, Self::Composing | Self::Publishing),
            _ => to.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// What the caller asks for at intake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub theme: String,
    pub language: String,

    /// Explicit topic; sampled from the locale's pool when absent
    #[serde(default)]
    pub topic: Option<String>,

    /// Content type; the locale's first supported type when absent
    #[serde(default)]
    pub content_type: Option<String>,

    /// Whether to run the publishing stage
    #[serde(default)]
    pub publish: bool,
}

impl JobRequest {
    pub fn new(theme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            language: language.into(),
            topic: None,
            content_type: None,
            publish: false,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }
}

/// One production run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub theme: String,
    pub language: String,
    pub content_type: String,
    pub topic: String,
    pub publish: bool,
    pub created_at: DateTime<Utc>,
    status: JobStatus,
}

impl Job {
    pub fn new(
        theme: String,
        language: String,
        content_type: String,
        topic: String,
        publish: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            theme,
            language,
            content_type,
            topic,
            publish,
            created_at: Utc::now(),
            status: JobStatus::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move the job to `to`, rejecting backwards or skipping transitions
    pub fn transition(&mut self, to: JobStatus) -> PipelineResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Structured reason a job did not reach `done`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub stage: Stage,
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    pub attempts: u32,
}

impl FailureReport {
    pub fn from_error(stage: Stage, error: &PipelineError, attempts: u32) -> Self {
        Self {
            stage,
            class: error.class(),
            code: error.code().to_string(),
            message: error.to_string(),
            attempts,
        }
    }
}

/// Location of the most advanced artifact a job produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ArtifactLocation {
    Script { path: PathBuf },
    Audio { path: PathBuf },
    Video { path: PathBuf, thumbnail: PathBuf },
    Published { remote_id: String, url: String },
}

/// Everything the intake surface hands back to its caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub theme: String,
    pub language: String,
    pub content_type: String,
    pub topic: String,
    pub script: Option<ScriptArtifact>,
    pub audio: Option<AudioArtifact>,
    pub video: Option<VideoArtifact>,
    pub publish: Option<PublishResult>,
    pub failure: Option<FailureReport>,
    pub last_artifact: Option<ArtifactLocation>,
    pub refresh_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "curiosidades".into(),
            "es".into(),
            "TOP_5".into(),
            "animales".into(),
            true,
        )
    }

    #[test]
    fn test_forward_transitions() {
        let mut job = job();
        for stage in Stage::ALL {
            job.transition(stage.status()).unwrap();
        }
        job.transition(JobStatus::Done).unwrap();
        assert_eq!(job.status(), JobStatus::Done);
    }

    #[test]
    fn test_no_backwards_or_skipping() {
        let mut job = job();
        job.transition(JobStatus::Resolving).unwrap();
        job.transition(JobStatus::Generating).unwrap();

        assert!(job.transition(JobStatus::Resolving).is_err());
        assert!(job.transition(JobStatus::Composing).is_err());
        assert!(job.transition(JobStatus::Generating).is_err());
    }

    #[test]
    fn test_partial_only_from_publishing() {
        assert!(!JobStatus::Composing.can_transition_to(JobStatus::Partial));
        assert!(JobStatus::Publishing.can_transition_to(JobStatus::Partial));
        assert!(!JobStatus::Generating.can_transition_to(JobStatus::Partial));
    }

    #[test]
    fn test_done_without_publishing() {
        assert!(JobStatus::Composing.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Synthesizing.can_transition_to(JobStatus::Done));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = job();
        job.transition(JobStatus::Failed).unwrap();
        assert!(job.transition(JobStatus::Resolving).is_err());
        assert!(job.transition(JobStatus::Failed).is_err());
    }

    #[test]
    fn test_request_builder() {
        let request = JobRequest::new("curiosidades", "es")
            .with_topic("volcanes")
            .with_publish(true);
        assert_eq!(request.topic.as_deref(), Some("volcanes"));
        assert!(request.content_type.is_none());
        assert!(request.publish);
    }
}
