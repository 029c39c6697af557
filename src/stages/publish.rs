//! Publishing stage.
//!
//! Uploads are idempotent per job and video. Before uploading, the
//! publisher checks a local ledger (`publish_ledger.jsonl`) and then asks
//! the platform for an earlier upload carrying the same idempotency key,
//! so a retry after a lost response never creates a second remote video.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{Credentials, PublishError, PublishTarget, RemoteVideo, UploadRequest};
use crate::config::PublishSettings;
use crate::core::event_store::generate_idempotency_key;
use crate::core::policy::retry_with_backoff;
use crate::domain::{PublishResult, ScriptArtifact, Stage, VideoArtifact, VideoMetadata};
use crate::error::{PipelineError, PipelineResult};
use crate::themes::LocaleConfig;

const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 4800;
const MAX_TAGS: usize = 15;

/// Build upload metadata from the script and locale
pub fn build_metadata(
    script: &ScriptArtifact,
    locale: &LocaleConfig,
    topic: &str,
    settings: &PublishSettings,
) -> VideoMetadata {
    let title: String = script.title.trim().chars().take(MAX_TITLE_CHARS).collect();

    let mut tags: Vec<String> = Vec::new();
    let mut push_tag = |tag: &str| {
        let tag = tag.trim();
        if !tag.is_empty() && !tags.iter().any(|t| t.to_lowercase() == tag.to_lowercase()) {
            tags.push(tag.to_string());
        }
    };
    locale.tags.iter().for_each(|t| push_tag(t));
    topic
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .for_each(&mut push_tag);
    script
        .hashtags
        .iter()
        .for_each(|h| push_tag(h.trim_start_matches('#')));
    tags.truncate(MAX_TAGS);

    let mut description = locale.description.trim().to_string();
    if !topic.trim().is_empty() {
        description.push_str(&format!("\n\n{}: {}", script.title.trim(), topic.trim()));
    }
    if !script.hashtags.is_empty() {
        description.push_str("\n\n");
        description.push_str(&script.hashtags.join(" "));
    }

    VideoMetadata {
        title,
        description: truncate_chars(&description, MAX_DESCRIPTION_CHARS),
        tags,
        visibility: settings.visibility,
        category_id: settings.category_id.clone(),
        language: locale.language.clone(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Append the idempotency reference without exceeding the description cap
fn with_reference(description: &str, key: &str) -> String {
    let reference = format!("\n\nref: {}", key);
    let budget = MAX_DESCRIPTION_CHARS.saturating_sub(reference.chars().count());
    format!("{}{}", truncate_chars(description, budget), reference)
}

/// One line of the publish ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    idempotency_key: String,
    result: PublishResult,
}

/// Local record of finished uploads, shared by every job and process
#[derive(Debug, Clone)]
pub struct PublishLedger {
    path: PathBuf,
}

impl PublishLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Earlier result for `key`, if any
    pub fn lookup(&self, key: &str) -> PipelineResult<Option<PublishResult>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = std::fs::File::open(&self.path)?;
        file.lock_shared()
            .map_err(|e| PipelineError::Store(format!("Failed to lock publish ledger: {}", e)))?;

        let mut found = None;
        for line in BufReader::new(&file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) if entry.idempotency_key == key => found = Some(entry.result),
                Ok(_) => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "Skipping unreadable ledger line"),
            }
        }

        // Lock is released when file is dropped
        Ok(found)
    }

    pub fn record(&self, result: &PublishResult) -> PipelineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.lock_exclusive()
            .map_err(|e| PipelineError::Store(format!("Failed to lock publish ledger: {}", e)))?;

        let entry = LedgerEntry {
            idempotency_key: result.idempotency_key.clone(),
            result: result.clone(),
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| PipelineError::Store(format!("Failed to serialize ledger entry: {}", e)))?;

        writeln!(file, "{}", json)?;
        file.flush()?;
        Ok(())
    }

    /// [`lookup`](Self::lookup) on the blocking pool
    pub async fn find(&self, key: &str) -> PipelineResult<Option<PublishResult>> {
        let ledger = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || ledger.lookup(&key))
            .await
            .map_err(|e| PipelineError::Store(format!("Publish ledger task aborted: {}", e)))?
    }

    /// [`record`](Self::record) on the blocking pool
    pub async fn append(&self, result: &PublishResult) -> PipelineResult<()> {
        let ledger = self.clone();
        let result = result.clone();
        tokio::task::spawn_blocking(move || ledger.record(&result))
            .await
            .map_err(|e| PipelineError::Store(format!("Publish ledger task aborted: {}", e)))?
    }
}

pub struct Publisher {
    target: Arc<dyn PublishTarget>,
    ledger: PublishLedger,
    settings: PublishSettings,
}

impl Publisher {
    pub fn new(target: Arc<dyn PublishTarget>, ledger: PublishLedger, settings: PublishSettings) -> Self {
        Self {
            target,
            ledger,
            settings,
        }
    }

    pub fn idempotency_key(job_id: Uuid, video: &VideoArtifact) -> String {
        generate_idempotency_key(job_id, Stage::Publishing.as_str(), &video.path.to_string_lossy())
    }

    #[instrument(skip_all, fields(target = %self.target.name(), job_id = %job_id))]
    pub async fn publish(
        &self,
        job_id: Uuid,
        video: &VideoArtifact,
        metadata: &VideoMetadata,
        credentials: &Credentials,
    ) -> PipelineResult<PublishResult> {
        let key = Self::idempotency_key(job_id, video);

        if let Some(previous) = self.ledger.find(&key).await? {
            info!(remote_id = %previous.remote_id, "Already published, returning recorded result");
            return Ok(previous);
        }

        let mut metadata = metadata.clone();
        metadata.description = with_reference(&metadata.description, &key);

        let existing = retry_with_backoff(
            &self.settings.upload_retry,
            "publish_lookup",
            |_| self.target.find_existing(&key, credentials),
            PublishError::is_transient,
        )
        .await
        .map_err(|(err, _)| map_publish_error(err))?;

        let remote = match existing {
            Some(remote) => {
                info!(remote_id = %remote.remote_id, "Found earlier upload for this job");
                remote
            }
            None => {
                let request = UploadRequest {
                    video: video.path.clone(),
                    metadata: metadata.clone(),
                    idempotency_key: key.clone(),
                };
                let remote = retry_with_backoff(
                    &self.settings.upload_retry,
                    "upload",
                    |_| self.target.upload(&request, credentials),
                    PublishError::is_transient,
                )
                .await
                .map_err(|(err, _)| map_publish_error(err))?;

                self.upload_thumbnail(&remote, &video.thumbnail, credentials).await;
                remote
            }
        };

        let result = PublishResult {
            remote_id: remote.remote_id,
            url: remote.url,
            visibility: metadata.visibility,
            metadata,
            idempotency_key: key,
            published_at: Utc::now(),
        };
        self.ledger.append(&result).await?;

        info!(remote_id = %result.remote_id, url = %result.url, "Video published");
        Ok(result)
    }

    async fn upload_thumbnail(&self, remote: &RemoteVideo, thumbnail: &Path, credentials: &Credentials) {
        if !thumbnail.exists() {
            return;
        }
        if let Err(e) = self
            .target
            .upload_thumbnail(&remote.remote_id, thumbnail, credentials)
            .await
        {
            warn!(remote_id = %remote.remote_id, error = %e, "Thumbnail upload failed");
        }
    }
}

pub(crate) fn map_publish_error(err: PublishError) -> PipelineError {
    match err {
        PublishError::AuthExpired(msg) => PipelineError::AuthExpired(msg),
        PublishError::Rejected(msg) => PipelineError::UploadRejected(msg),
        PublishError::Network(msg) => PipelineError::UploadUnavailable(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NarrationSegment, SegmentKind, Visibility};
    use crate::themes::DurationBounds;
    use std::time::Duration;

    fn locale() -> LocaleConfig {
        LocaleConfig {
            theme: "curiosidades".to_string(),
            language: "es".to_string(),
            channel_name: "Datos Increíbles".to_string(),
            description: "Datos curiosos cada día".to_string(),
            tags: vec!["curiosidades".to_string(), "Shorts".to_string()],
            content_types: vec!["TOP_5".to_string()],
            topics: vec!["animales raros".to_string()],
            duration_bounds: DurationBounds::default(),
        }
    }

    fn script(title: &str, hashtags: &[&str]) -> ScriptArtifact {
        ScriptArtifact {
            title: title.to_string(),
            segments: vec![NarrationSegment {
                kind: SegmentKind::Hook,
                text: "hola".to_string(),
                keywords: "hola".to_string(),
                target_duration: Duration::from_secs(2),
            }],
            hashtags: hashtags.iter().map(|s| s.to_string()).collect(),
            raw_chars: 10,
            generation_attempts: 1,
        }
    }

    #[test]
    fn test_metadata_tags_dedup_and_cap() {
        let meta = build_metadata(
            &script("5 animales raros", &["#shorts", "#Animales", "#Ciencia"]),
            &locale(),
            "animales raros del océano",
            &PublishSettings::default(),
        );
        assert_eq!(
            meta.tags,
            vec!["curiosidades", "Shorts", "animales", "raros", "océano", "Ciencia"]
        );
        assert_eq!(meta.visibility, Visibility::Private);
        assert_eq!(meta.category_id, "24");
        assert!(meta.description.starts_with("Datos curiosos cada día"));
        assert!(meta.description.ends_with("#shorts #Animales #Ciencia"));

        let many: Vec<String> = (0..30).map(|i| format!("#tag{}", i)).collect();
        let many: Vec<&str> = many.iter().map(String::as_str).collect();
        let meta = build_metadata(&script("t", &many), &locale(), "x", &PublishSettings::default());
        assert_eq!(meta.tags.len(), 15);
    }

    #[test]
    fn test_title_truncated() {
        let long = "a".repeat(150);
        let meta = build_metadata(&script(&long, &[]), &locale(), "", &PublishSettings::default());
        assert_eq!(meta.title.chars().count(), 100);
    }

    #[test]
    fn test_reference_respects_cap() {
        let description = "x".repeat(5000);
        let result = with_reference(&description, "job:publishing:0123456789abcdef");
        assert_eq!(result.chars().count(), MAX_DESCRIPTION_CHARS);
        assert!(result.ends_with("ref: job:publishing:0123456789abcdef"));
    }

    #[test]
    fn test_ledger_roundtrip() {
        let temp = tempfile::TempDir::new().unwrap();
        let ledger = PublishLedger::new(temp.path().join("state/publish_ledger.jsonl"));
        assert!(ledger.lookup("k1").unwrap().is_none());

        let result = PublishResult {
            remote_id: "abc".to_string(),
            url: "https://youtube.com/shorts/abc".to_string(),
            visibility: Visibility::Private,
            metadata: build_metadata(&script("t", &[]), &locale(), "x", &PublishSettings::default()),
            idempotency_key: "k1".to_string(),
            published_at: Utc::now(),
        };
        ledger.record(&result).unwrap();

        assert_eq!(ledger.lookup("k1").unwrap().unwrap().remote_id, "abc");
        assert!(ledger.lookup("k2").unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_ledger_from_async_context() {
        let temp = tempfile::TempDir::new().unwrap();
        let ledger = PublishLedger::new(temp.path().join("publish_ledger.jsonl"));
        assert!(ledger.find("k1").await.unwrap().is_none());

        let result = PublishResult {
            remote_id: "def".to_string(),
            url: "https://youtube.com/shorts/def".to_string(),
            visibility: Visibility::Unlisted,
            metadata: build_metadata(&script("t", &[]), &locale(), "x", &PublishSettings::default()),
            idempotency_key: "k1".to_string(),
            published_at: Utc::now(),
        };

        // A second handle on the same file sees the entry
        ledger.append(&result).await.unwrap();
        let reopened = PublishLedger::new(temp.path().join("publish_ledger.jsonl"));
        assert_eq!(reopened.find("k1").await.unwrap().unwrap().remote_id, "def");
    }
}
