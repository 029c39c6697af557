//! Idempotency Integration Tests
//!
//! Tests for idempotency key generation and completed-stage detection.

use shortforge::core::{generate_idempotency_key, JobStore};
use shortforge::domain::{Event, EventType, JobRecord, Resolution, Stage, VideoArtifact};
use shortforge::stages::Publisher;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn stage_event(job_id: Uuid, stage: Stage, event_type: EventType, key: &str) -> Event {
    Event::new(
        job_id,
        Some(stage),
        event_type,
        key.to_string(),
        format!("Stage '{}'", stage),
    )
}

async fn stage_completed(store: &JobStore, stage: Stage) -> bool {
    let events = store.replay().await.unwrap();
    JobRecord::from_events(&events).is_some_and(|record| record.is_stage_completed(stage))
}

#[tokio::test]
async fn test_stage_completion_from_log() {
    let temp_dir = TempDir::new().unwrap();
    let job_id = Uuid::new_v4();
    let store = JobStore::open(temp_dir.path(), job_id).await.unwrap();

    let key = generate_idempotency_key(job_id, "generating", "Crea un guion sobre pulpos");

    // Initially not completed
    assert!(!stage_completed(&store, Stage::Generating).await);

    // Started is not completed
    store
        .append(&stage_event(job_id, Stage::Generating, EventType::StageStarted, &key))
        .await
        .unwrap();
    assert!(!stage_completed(&store, Stage::Generating).await);

    store
        .append(&stage_event(job_id, Stage::Generating, EventType::StageCompleted, &key))
        .await
        .unwrap();
    assert!(stage_completed(&store, Stage::Generating).await);
}

#[test]
fn test_different_stages_same_input() {
    let job_id = Uuid::new_v4();
    let input = "same input";

    let key1 = generate_idempotency_key(job_id, "synthesizing", input);
    let key2 = generate_idempotency_key(job_id, "composing", input);

    // Same input hash, different stage
    assert_ne!(key1, key2);
    assert_eq!(key1.split(':').nth(2), key2.split(':').nth(2));
}

#[test]
fn test_same_stage_different_inputs() {
    let job_id = Uuid::new_v4();

    let key1 = generate_idempotency_key(job_id, "generating", "prompt A");
    let key2 = generate_idempotency_key(job_id, "generating", "prompt B");

    assert_ne!(key1, key2);
}

#[tokio::test]
async fn test_failed_stage_not_completed() {
    let temp_dir = TempDir::new().unwrap();
    let job_id = Uuid::new_v4();
    let store = JobStore::open(temp_dir.path(), job_id).await.unwrap();
    let key = generate_idempotency_key(job_id, "composing", "voice.mp3");

    store
        .append(&stage_event(job_id, Stage::Composing, EventType::StageStarted, &key))
        .await
        .unwrap();
    store
        .append(
            &stage_event(job_id, Stage::Composing, EventType::StageFailed, &key)
                .with_error("image_source_exhausted: no images".to_string()),
        )
        .await
        .unwrap();

    assert!(!stage_completed(&store, Stage::Composing).await);
}

#[tokio::test]
async fn test_retried_then_completed() {
    let temp_dir = TempDir::new().unwrap();
    let job_id = Uuid::new_v4();
    let store = JobStore::open(temp_dir.path(), job_id).await.unwrap();
    let key = generate_idempotency_key(job_id, "publishing", "video.mp4");

    store
        .append(&stage_event(job_id, Stage::Publishing, EventType::StageStarted, &key))
        .await
        .unwrap();
    store
        .append(&stage_event(
            job_id,
            Stage::Publishing,
            EventType::StageRetrying,
            &format!("{}:retry:1", key),
        ))
        .await
        .unwrap();
    assert!(!stage_completed(&store, Stage::Publishing).await);

    store
        .append(&stage_event(job_id, Stage::Publishing, EventType::StageStarted, &key))
        .await
        .unwrap();
    store
        .append(&stage_event(job_id, Stage::Publishing, EventType::StageCompleted, &key))
        .await
        .unwrap();
    assert!(stage_completed(&store, Stage::Publishing).await);
}

#[test]
fn test_publish_key_follows_job_and_video() {
    let video = |path: &str| VideoArtifact {
        path: PathBuf::from(path),
        resolution: Resolution::PORTRAIT_1080,
        duration: Duration::from_secs(40),
        thumbnail: PathBuf::from("thumbnail.jpg"),
        captions: PathBuf::from("captions.srt"),
        images: vec![],
    };
    let job_id = Uuid::new_v4();

    let key = Publisher::idempotency_key(job_id, &video("/jobs/a/video.mp4"));

    // Stable across retries of the same job
    assert_eq!(key, Publisher::idempotency_key(job_id, &video("/jobs/a/video.mp4")));
    assert_ne!(key, Publisher::idempotency_key(Uuid::new_v4(), &video("/jobs/a/video.mp4")));
    assert_ne!(key, Publisher::idempotency_key(job_id, &video("/jobs/b/video.mp4")));
    assert!(key.starts_with(&format!("{}:publishing:", job_id)));
}
