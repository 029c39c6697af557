//! Error taxonomy for the production pipeline.
//!
//! Every failure a stage can report is a [`PipelineError`]. The orchestrator
//! never matches on individual variants to decide what to do next; it asks
//! for the [`ErrorClass`] instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad failure classes used for retry and finalization decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Missing or broken definitions; retrying cannot help
    Configuration,

    /// Network, rate limit or timeout; retried with backoff
    Transient,

    /// Generated output violated a format or duration constraint
    Validation,

    /// A required resource could not be produced
    Resource,

    /// Credentials expired; one refresh cycle is allowed
    Auth,

    /// The platform refused the upload
    Rejection,

    /// The job was cancelled between stages
    Cancelled,

    /// Local I/O or bookkeeping failure
    Internal,
}

impl ErrorClass {
    /// Whether the orchestrator may re-run the current stage
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Theme not found: {theme}")]
    ThemeNotFound { theme: String },

    #[error("Locale '{language}' not found for theme '{theme}' and no default locale is configured")]
    LocaleNotFound { theme: String, language: String },

    #[error("Invalid theme '{theme}': {reason}")]
    InvalidTheme { theme: String, reason: String },

    #[error("No prompt template for theme '{theme}', language '{language}', content type '{content_type}'")]
    TemplateNotFound {
        theme: String,
        language: String,
        content_type: String,
    },

    #[error("Placeholder '{{{placeholder}}}' in template '{template}' has no value")]
    UnboundPlaceholder { placeholder: String, template: String },

    #[error("Generation backend unavailable after {attempts} attempts: {message}")]
    BackendUnavailable { attempts: u32, message: String },

    #[error("Generated script is malformed after {attempts} attempts: {reason}")]
    GenerationMalformed { attempts: u32, reason: String },

    #[error("Estimated narration of {actual_secs:.1}s is outside {min_secs}-{max_secs}s")]
    DurationOutOfBounds {
        actual_secs: f64,
        min_secs: u32,
        max_secs: u32,
    },

    #[error("Synthesis of segment {segment} failed after {attempts} attempts: {message}")]
    SynthesisFailed {
        segment: usize,
        attempts: u32,
        message: String,
    },

    #[error("No image found for segment {segment} (query '{query}', fallback '{fallback}')")]
    ImageSourceExhausted {
        segment: usize,
        query: String,
        fallback: String,
    },

    #[error("Image source request failed: {0}")]
    ImageSourceUnavailable(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Publish credentials expired: {0}")]
    AuthExpired(String),

    #[error("Upload rejected by platform: {0}")]
    UploadRejected(String),

    #[error("Upload failed: {0}")]
    UploadUnavailable(String),

    #[error("Stage '{stage}' timed out after {elapsed:?}")]
    StageTimeout { stage: String, elapsed: Duration },

    #[error("Job cancelled before stage '{stage}'")]
    Cancelled { stage: String },

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Job store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Classify this error for the orchestrator
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ThemeNotFound { .. }
            | Self::LocaleNotFound { .. }
            | Self::InvalidTheme { .. }
            | Self::TemplateNotFound { .. }
            | Self::UnboundPlaceholder { .. } => ErrorClass::Configuration,

            Self::BackendUnavailable { .. }
            | Self::SynthesisFailed { .. }
            | Self::ImageSourceUnavailable(_)
            | Self::UploadUnavailable(_)
            | Self::StageTimeout { .. } => ErrorClass::Transient,

            Self::GenerationMalformed { .. } | Self::DurationOutOfBounds { .. } => {
                ErrorClass::Validation
            }

            Self::ImageSourceExhausted { .. } | Self::EncodingFailed(_) => ErrorClass::Resource,

            Self::AuthExpired(_) => ErrorClass::Auth,
            Self::UploadRejected(_) => ErrorClass::Rejection,
            Self::Cancelled { .. } => ErrorClass::Cancelled,

            Self::InvalidTransition { .. } | Self::Store(_) | Self::Io(_) => ErrorClass::Internal,
        }
    }

    /// Short machine-readable code, used in job results and events
    pub fn code(&self) -> &'static str {
        match self {
            Self::ThemeNotFound { .. } => "theme_not_found",
            Self::LocaleNotFound { .. } => "locale_not_found",
            Self::InvalidTheme { .. } => "invalid_theme",
            Self::TemplateNotFound { .. } => "template_not_found",
            Self::UnboundPlaceholder { .. } => "unbound_placeholder",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::GenerationMalformed { .. } => "generation_malformed",
            Self::DurationOutOfBounds { .. } => "duration_out_of_bounds",
            Self::SynthesisFailed { .. } => "synthesis_failed",
            Self::ImageSourceExhausted { .. } => "image_source_exhausted",
            Self::ImageSourceUnavailable(_) => "image_source_unavailable",
            Self::EncodingFailed(_) => "encoding_failed",
            Self::AuthExpired(_) => "auth_expired",
            Self::UploadRejected(_) => "upload_rejected",
            Self::UploadUnavailable(_) => "upload_unavailable",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
