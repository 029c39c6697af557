//! Job summaries reconstructed from the event log.
//!
//! The in-memory [`Job`](super::Job) only lives while the orchestrator runs
//! it; afterwards a [`JobRecord`] replayed from `events.jsonl` is what
//! status queries see.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};
use super::job::{JobStatus, Stage};

/// Per-stage outcome as seen in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Running,
    Retrying,
    Completed,
    Failed,
}

/// Summary of a job derived by replaying its events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub summary: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: HashMap<Stage, StageOutcome>,
    pub attempts: HashMap<Stage, u32>,
    pub error: Option<String>,
    pub credential_refreshes: u32,
}

impl JobRecord {
    /// Reconstruct a job summary from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut record = Self {
            id: first.job_id,
            summary: String::new(),
            status: JobStatus::Pending,
            started_at: first.timestamp,
            finished_at: None,
            stages: HashMap::new(),
            attempts: HashMap::new(),
            error: None,
            credential_refreshes: 0,
        };

        for event in events {
            record.apply_event(event);
        }

        Some(record)
    }

    /// Apply a single event to update the summary
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::JobStarted => {
                self.summary = event.payload_summary.clone();
                self.started_at = event.timestamp;
            }
            EventType::JobCompleted => self.finish(JobStatus::Done, event),
            EventType::JobPartial => self.finish(JobStatus::Partial, event),
            EventType::JobFailed | EventType::JobCancelled => self.finish(JobStatus::Failed, event),
            EventType::StageStarted => {
                if let Some(stage) = event.stage {
                    self.status = stage.status();
                    self.stages.insert(stage, StageOutcome::Running);
                    *self.attempts.entry(stage).or_insert(0) += 1;
                }
            }
            EventType::StageRetrying => {
                if let Some(stage) = event.stage {
                    self.stages.insert(stage, StageOutcome::Retrying);
                }
            }
            EventType::StageCompleted => {
                if let Some(stage) = event.stage {
                    self.stages.insert(stage, StageOutcome::Completed);
                }
            }
            EventType::StageFailed => {
                if let Some(stage) = event.stage {
                    self.stages.insert(stage, StageOutcome::Failed);
                }
            }
            EventType::CredentialsRefreshed => self.credential_refreshes += 1,
        }
    }

    fn finish(&mut self, status: JobStatus, event: &Event) {
        self.status = status;
        self.finished_at = Some(event.timestamp);
        if event.error.is_some() {
            self.error = event.error.clone();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_stage_completed(&self, stage: Stage) -> bool {
        self.stages.get(&stage) == Some(&StageOutcome::Completed)
    }
}
