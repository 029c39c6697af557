//! Adapter interfaces for external systems.
//!
//! Each stage talks to the outside world through one of these traits.
//! Concrete implementations wrap HTTP APIs (Ollama, OpenAI-compatible
//! endpoints, Pexels, YouTube) or subprocesses (edge-tts, ffmpeg); tests
//! substitute in-memory fakes.

pub mod edge_tts;
pub mod ffmpeg;
pub mod ollama;
pub mod pexels;
pub mod remote;
pub mod youtube;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::domain::{CaptionCue, Resolution, VideoMetadata};

pub use edge_tts::EdgeTtsVoice;
pub use ffmpeg::FfmpegRenderer;
pub use ollama::OllamaBackend;
pub use pexels::PexelsSource;
pub use remote::RemoteBackend;
pub use youtube::{OAuthCredentials, YouTubePublisher};

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("connection failed: {0}")]
    Connection(String),

    /// The backend answered but refused the request (bad model, bad key)
    #[error("backend error: {0}")]
    Response(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Response(_))
    }
}

/// "Accept prompt text, return text within a token budget"
#[async_trait]
pub trait TextBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, BackendError>;
}

/// Build the backend selected in configuration
pub fn build_backend(config: &BackendConfig, request_timeout: Duration) -> Arc<dyn TextBackend> {
    match config {
        BackendConfig::Ollama {
            base_url,
            model,
            temperature,
            top_p,
            ..
        } => Arc::new(OllamaBackend::new(
            base_url.clone(),
            model.clone(),
            *temperature,
            *top_p,
            request_timeout,
        )),
        BackendConfig::Remote {
            base_url,
            model,
            api_key,
            temperature,
            ..
        } => Arc::new(RemoteBackend::new(
            base_url.clone(),
            model.clone(),
            api_key.clone(),
            *temperature,
            request_timeout,
        )),
    }
}

/// Map a reqwest failure onto the backend taxonomy
pub(crate) fn classify_http_error(err: &reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        BackendError::Connection(err.to_string())
    } else {
        BackendError::Response(err.to_string())
    }
}

/// Map a non-success HTTP status onto the backend taxonomy
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> BackendError {
    let detail = format!("{}: {}", status, truncate(body, 200));
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        BackendError::RateLimited(detail)
    } else if status.is_server_error() {
        BackendError::Connection(detail)
    } else {
        BackendError::Response(detail)
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

// ---------------------------------------------------------------------------
// Voice
// ---------------------------------------------------------------------------

/// Audio for one piece of text
#[derive(Debug, Clone)]
pub struct SynthesizedClip {
    pub audio: Vec<u8>,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice backend unavailable: {0}")]
    Unavailable(String),

    #[error("voice backend rejected the request: {0}")]
    Rejected(String),
}

impl VoiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait VoiceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedClip, VoiceError>;
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// A candidate image returned by a search
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub id: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl ImageRef {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image source unavailable: {0}")]
    Unavailable(String),

    #[error("image source rejected the request: {0}")]
    Rejected(String),
}

impl ImageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    fn name(&self) -> &str;

    /// Zero or more images for `query`
    async fn search(&self, query: &str, count: usize) -> Result<Vec<ImageRef>, ImageError>;

    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, ImageError>;
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// One still shown for the length of its audio segment
#[derive(Debug, Clone)]
pub struct RenderClip {
    pub image: PathBuf,
    pub duration: Duration,
    /// Timed captions, relative to the start of this clip
    pub captions: Vec<CaptionCue>,
}

/// Everything the renderer needs to encode a video
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub output: PathBuf,
    pub audio: PathBuf,
    pub clips: Vec<RenderClip>,
    pub resolution: Resolution,
    pub fps: u32,
    /// Channel name drawn on every frame
    pub branding: String,
    pub font_file: Option<PathBuf>,
}

impl RenderPlan {
    pub fn total_duration(&self) -> Duration {
        self.clips.iter().map(|c| c.duration).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ThumbnailPlan {
    pub output: PathBuf,
    /// Background image; a plain title card when absent
    pub image: Option<PathBuf>,
    pub title: String,
    pub resolution: Resolution,
    pub font_file: Option<PathBuf>,
}

/// What the encoder actually produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOutput {
    pub duration: Duration,
    pub resolution: Resolution,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer failed: {0}")]
    Failed(String),

    #[error("renderer IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("render cancelled")]
    Cancelled,
}

/// CPU-bound encoder; always called from the blocking pool.
///
/// Implementations stop work and clean up once `cancel` fires; the caller
/// fires it when it stops waiting for the result.
pub trait Renderer: Send + Sync {
    fn render(&self, plan: &RenderPlan, cancel: &CancellationToken) -> Result<RenderOutput, RenderError>;

    fn render_thumbnail(&self, plan: &ThumbnailPlan, cancel: &CancellationToken) -> Result<(), RenderError>;
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Short-lived access token for the publish target
#[derive(Clone)]
pub struct Credentials {
    pub access_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub video: PathBuf,
    pub metadata: VideoMetadata,
    pub idempotency_key: String,
}

/// Identifier and URL of an uploaded video
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVideo {
    pub remote_id: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("credentials expired: {0}")]
    AuthExpired(String),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("network failure: {0}")]
    Network(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

#[async_trait]
pub trait PublishTarget: Send + Sync {
    fn name(&self) -> &str;

    /// A video previously uploaded under `idempotency_key`, if any
    async fn find_existing(
        &self,
        idempotency_key: &str,
        credentials: &Credentials,
    ) -> Result<Option<RemoteVideo>, PublishError>;

    async fn upload(
        &self,
        request: &UploadRequest,
        credentials: &Credentials,
    ) -> Result<RemoteVideo, PublishError>;

    async fn upload_thumbnail(
        &self,
        remote_id: &str,
        thumbnail: &std::path::Path,
        credentials: &Credentials,
    ) -> Result<(), PublishError>;
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Cached credentials, obtaining fresh ones on first use
    async fn current(&self) -> Result<Credentials, PublishError>;

    /// Force a refresh after the target reported expiry
    async fn refresh(&self) -> Result<Credentials, PublishError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_classes() {
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BackendError::RateLimited("429".into()).is_transient());
        assert!(!BackendError::Response("400".into()).is_transient());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            BackendError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY, "upstream"),
            BackendError::Connection(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::NOT_FOUND, "model not found"),
            BackendError::Response(_)
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let creds = Credentials {
            access_token: "ya29.secret".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("secret"));
    }

    #[test]
    fn test_build_backend_by_kind() {
        let backend = build_backend(&BackendConfig::default(), Duration::from_secs(5));
        assert_eq!(backend.name(), "ollama");
    }
}
