//! Append-only per-job event log with file-based persistence.
//!
//! Each job owns `<jobs_dir>/<job_id>/` with an `events.jsonl` file (one
//! JSON event per line) and an `artifacts/` directory for stage outputs.
//! Events are stored as JSONL for easy inspection with standard tools.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, EventType};
use crate::error::{PipelineError, PipelineResult};

/// File-based event store for one job
#[derive(Debug, Clone)]
pub struct JobStore {
    /// Directory containing the job
    job_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Path to artifacts directory
    artifacts_dir: PathBuf,
}

fn store_error(action: &str, path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Store(format!("Failed to {} {}: {}", action, path.display(), err))
}

impl JobStore {
    /// Create or open the store of `job_id` under `jobs_dir`
    pub async fn open(jobs_dir: &Path, job_id: Uuid) -> PipelineResult<Self> {
        let job_dir = jobs_dir.join(job_id.to_string());
        let artifacts_dir = job_dir.join("artifacts");

        fs::create_dir_all(&artifacts_dir)
            .await
            .map_err(|e| store_error("create artifacts directory", &artifacts_dir, e))?;

        Ok(Self {
            events_path: job_dir.join("events.jsonl"),
            job_dir,
            artifacts_dir,
        })
    }

    /// Open an existing job without creating anything
    pub fn existing(jobs_dir: &Path, job_id: Uuid) -> Option<Self> {
        let job_dir = jobs_dir.join(job_id.to_string());
        let events_path = job_dir.join("events.jsonl");
        if !events_path.exists() {
            return None;
        }
        Some(Self {
            artifacts_dir: job_dir.join("artifacts"),
            events_path,
            job_dir,
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Store a serializable artifact as pretty JSON
    pub async fn store_json<T: Serialize>(&self, name: &str, value: &T) -> PipelineResult<PathBuf> {
        let path = self.artifacts_dir.join(format!("{}.json", name));
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| store_error("serialize artifact", &path, e))?;

        fs::write(&path, content)
            .await
            .map_err(|e| store_error("write artifact", &path, e))?;

        Ok(path)
    }

    /// Load a JSON artifact stored with [`store_json`](Self::store_json)
    pub async fn load_json<T: DeserializeOwned>(&self, name: &str) -> PipelineResult<Option<T>> {
        let path = self.artifacts_dir.join(format!("{}.json", name));

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| store_error("read artifact", &path, e))?;

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| store_error("parse artifact", &path, e))
    }

    /// List artifact file names in this job
    pub async fn list_artifacts(&self) -> PipelineResult<Vec<String>> {
        let mut artifacts = Vec::new();

        if !self.artifacts_dir.exists() {
            return Ok(artifacts);
        }

        let mut entries = fs::read_dir(&self.artifacts_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                artifacts.push(name.to_string());
            }
        }

        artifacts.sort();
        Ok(artifacts)
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> PipelineResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .map_err(|e| store_error("open events file", &self.events_path, e))?;

        let json = serde_json::to_string(event)
            .map_err(|e| store_error("serialize event for", &self.events_path, e))?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(|e| store_error("write event to", &self.events_path, e))?;
        file.flush()
            .await
            .map_err(|e| store_error("flush", &self.events_path, e))?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> PipelineResult<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .map_err(|e| store_error("open events file", &self.events_path, e))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .map_err(|e| store_error("parse event in", &self.events_path, e))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> PipelineResult<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List all job IDs under `jobs_dir`
    pub async fn list_jobs(jobs_dir: &Path) -> PipelineResult<Vec<Uuid>> {
        if !jobs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(jobs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        jobs.push(uuid);
                    }
                }
            }
        }

        Ok(jobs)
    }
}

/// Generate an idempotency key for a stage
pub fn generate_idempotency_key(job_id: Uuid, stage: &str, input: &str) -> String {
    format!("{}:{}:{}", job_id, stage, hash_input(input))
}

/// Hash input content (first 16 hex chars of SHA-256)
pub fn hash_input(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}
