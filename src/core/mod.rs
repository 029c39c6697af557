//! Core orchestration logic.
//!
//! This module contains:
//! - JobStore: append-only per-job event log and artifact directory
//! - Policy: stage timeouts and retry with backoff
//! - Orchestrator: job state machine, stage sequencing and batch mode

pub mod event_store;
pub mod orchestrator;
pub mod policy;

// Re-export commonly used types
pub use event_store::{generate_idempotency_key, hash_input, JobStore};
pub use orchestrator::{Backends, Orchestrator};
pub use policy::{retry_with_backoff, RetryPolicy, StageLimits};
