//! shortforge - staged production pipeline for short vertical videos
//!
//! Turns a theme and language into a generated script, a synthesized
//! voice track, a composed 9:16 video with thumbnail, and optionally a
//! published upload.
//!
//! # Architecture
//!
//! Data flows strictly downstream through the stages, coordinated by the
//! orchestrator:
//!
//! ```text
//! themes -> prompts -> script -> voice -> visual -> publish
//! ```
//!
//! - Every job has its own append-only event log; job status is derived
//!   by replaying events
//! - Each stage has an independent timeout and bounded retry budget
//! - A publish failure after a composed video ends the job as `partial`
//!
//! # Modules
//!
//! - `themes`: theme registry (built-in catalog + user overrides), topic sampling
//! - `prompts`: prompt templates and placeholder substitution
//! - `stages`: script, voice, visual and publish stages
//! - `adapters`: external systems (Ollama, OpenAI-compatible APIs, edge-tts,
//!   Pexels, ffmpeg, YouTube)
//! - `core`: orchestrator, job event store, retry policy
//! - `domain`: jobs, artifacts, events
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Produce one video about a sampled topic
//! shortforge run --theme curiosidades --language es
//!
//! # Produce and upload three videos, two at a time
//! shortforge batch -n 3 --publish --max-concurrent 2
//!
//! # Check job status
//! shortforge status <job-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod prompts;
pub mod stages;
pub mod themes;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{Backends, Orchestrator};
pub use domain::{Event, EventType, Job, JobRequest, JobResult, JobStatus, Stage};
pub use error::{ErrorClass, PipelineError, PipelineResult};
pub use prompts::PromptResolver;
pub use themes::{ThemeRegistry, TopicSampler};
