//! Script Generation Integration Tests
//!
//! Tests for regeneration on malformed output, the single duration
//! adjustment, and backend retry exhaustion.

mod common;

use std::sync::Arc;

use common::{script, ScriptedText};
use shortforge::adapters::BackendError;
use shortforge::config::GenerationSettings;
use shortforge::core::RetryPolicy;
use shortforge::stages::{ScriptGenerator, ScriptRequest};
use shortforge::themes::DurationBounds;
use shortforge::PipelineError;

/// 130 words at 120 wpm: 65 seconds
const TOO_LONG: [usize; 7] = [20, 18, 18, 18, 18, 18, 20];

/// 90 words at 120 wpm: 45 seconds
const FITS: [usize; 7] = [12, 13, 13, 13, 13, 13, 13];

fn settings() -> GenerationSettings {
    GenerationSettings {
        words_per_minute: 120.0,
        backend_retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

fn request() -> ScriptRequest {
    ScriptRequest {
        prompt: "Crea un guion sobre pulpos".to_string(),
        topic: "pulpos".to_string(),
        bounds: DurationBounds::default(),
        default_hashtags: vec!["#Shorts".to_string()],
    }
}

fn generator(text: &Arc<ScriptedText>) -> ScriptGenerator {
    ScriptGenerator::new(text.clone(), settings())
}

#[tokio::test]
async fn test_too_long_twice_fails_after_exactly_two_calls() {
    let text = Arc::new(ScriptedText::new(script(&TOO_LONG)));

    let err = generator(&text).generate(&request()).await.unwrap_err();

    assert_eq!(text.calls(), 2);
    match err {
        PipelineError::DurationOutOfBounds {
            actual_secs,
            min_secs,
            max_secs,
        } => {
            assert!((actual_secs - 65.0).abs() < 0.01, "actual {}", actual_secs);
            assert_eq!((min_secs, max_secs), (30, 60));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The second call carries an instruction to shorten
    let prompts = text.prompts.lock().unwrap().clone();
    assert_eq!(prompts[0], "Crea un guion sobre pulpos");
    assert!(prompts[1].starts_with("Crea un guion sobre pulpos"));
    assert!(prompts[1].contains("shorter"));
}

#[tokio::test]
async fn test_adjusted_script_within_bounds_is_accepted() {
    let text = Arc::new(
        ScriptedText::new(script(&FITS)).with_responses(vec![Ok(script(&TOO_LONG))]),
    );

    let artifact = generator(&text).generate(&request()).await.unwrap();

    assert_eq!(text.calls(), 2);
    assert_eq!(artifact.generation_attempts, 2);
    let secs = artifact.estimated_duration().as_secs_f64();
    assert!((secs - 45.0).abs() < 0.01);
}

#[tokio::test]
async fn test_too_short_asks_for_longer() {
    let text = Arc::new(
        ScriptedText::new(script(&FITS)).with_responses(vec![Ok(script(&[4, 4, 4, 4, 4, 4, 4]))]),
    );

    generator(&text).generate(&request()).await.unwrap();

    let prompts = text.prompts.lock().unwrap().clone();
    assert!(prompts[1].contains("longer"));
}

#[tokio::test]
async fn test_malformed_output_is_regenerated() {
    let text = Arc::new(
        ScriptedText::new(script(&FITS))
            .with_responses(vec![Ok("Lo siento, no puedo ayudar con eso.".to_string())]),
    );

    let artifact = generator(&text).generate(&request()).await.unwrap();

    assert_eq!(text.calls(), 2);
    assert_eq!(artifact.generation_attempts, 2);
    assert_eq!(artifact.segments.len(), 7);
    assert_eq!(artifact.title, "Datos que no conocías");
}

#[tokio::test]
async fn test_persistently_malformed_output_fails() {
    let text = Arc::new(ScriptedText::new("[TITLE] solo un título"));

    let err = generator(&text).generate(&request()).await.unwrap_err();

    // First try plus two regenerations
    assert_eq!(text.calls(), 3);
    assert!(matches!(err, PipelineError::GenerationMalformed { attempts: 3, .. }));
}

#[tokio::test]
async fn test_transient_backend_errors_are_retried() {
    let text = Arc::new(ScriptedText::new(script(&FITS)).with_responses(vec![
        Err(BackendError::Connection("refused".to_string())),
        Err(BackendError::RateLimited("429".to_string())),
    ]));

    let artifact = generator(&text).generate(&request()).await.unwrap();

    assert_eq!(text.calls(), 3);
    // Only answered calls count as generations
    assert_eq!(artifact.generation_attempts, 1);
}

#[tokio::test]
async fn test_unreachable_backend_exhausts_retries() {
    let text = Arc::new(ScriptedText::new(script(&FITS)).with_responses(vec![
        Err(BackendError::Connection("refused".to_string())),
        Err(BackendError::Connection("refused".to_string())),
        Err(BackendError::Connection("refused".to_string())),
    ]));

    let err = generator(&text).generate(&request()).await.unwrap_err();

    assert_eq!(text.calls(), 3);
    assert!(matches!(err, PipelineError::BackendUnavailable { attempts: 3, .. }));
    assert!(err.class().is_retryable());
}

#[tokio::test]
async fn test_refused_request_is_not_retried() {
    let text = Arc::new(
        ScriptedText::new(script(&FITS))
            .with_responses(vec![Err(BackendError::Response("model not found".to_string()))]),
    );

    let err = generator(&text).generate(&request()).await.unwrap_err();

    assert_eq!(text.calls(), 1);
    assert!(matches!(err, PipelineError::BackendUnavailable { attempts: 1, .. }));
}

#[tokio::test]
async fn test_missing_hashtags_use_defaults() {
    let raw = script(&FITS)
        .lines()
        .filter(|line| !line.starts_with("[HASHTAGS]"))
        .collect::<Vec<_>>()
        .join("\n");
    let text = Arc::new(ScriptedText::new(raw));

    let artifact = generator(&text).generate(&request()).await.unwrap();

    assert_eq!(artifact.hashtags, vec!["#Shorts".to_string()]);
}
