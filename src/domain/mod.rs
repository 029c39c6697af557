//! Domain types for the production pipeline.
//!
//! This module contains the core data structures:
//! - Job: the state machine of one production run
//! - Artifacts: stage outputs (script, audio, video, publish result)
//! - Events: immutable records of job state changes
//! - JobRecord: job summaries replayed from the event log

pub mod artifact;
pub mod events;
pub mod job;
pub mod record;

// Re-export commonly used types
pub use artifact::{
    AudioArtifact, CaptionCue, NarrationSegment, PublishResult, Resolution, ScriptArtifact, SegmentKind,
    SegmentTiming, VideoArtifact, VideoMetadata, Visibility,
};
pub use events::{Event, EventType};
pub use job::{ArtifactLocation, FailureReport, Job, JobRequest, JobResult, JobStatus, Stage};
pub use record::{JobRecord, StageOutcome};
