//! Artifacts produced by pipeline stages.
//!
//! Each stage produces its artifact once; later stages borrow it.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a narration segment within the script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "number")]
pub enum SegmentKind {
    Hook,
    Point(u32),
    Outro,
}

/// One narrated unit of the script, shown on screen as one visual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationSegment {
    pub kind: SegmentKind,

    /// Text to speak (already cleaned for TTS)
    pub text: String,

    /// Search keywords for the visual of this segment
    pub keywords: String,

    /// Estimated display time derived from word count
    #[serde(with = "duration_secs")]
    pub target_duration: Duration,
}

/// Validated output of the script generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptArtifact {
    pub title: String,
    pub segments: Vec<NarrationSegment>,
    pub hashtags: Vec<String>,

    /// Length of the raw backend text in characters
    pub raw_chars: usize,

    /// Number of backend invocations needed to get this script
    pub generation_attempts: u32,
}

impl ScriptArtifact {
    /// Total estimated narration time
    pub fn estimated_duration(&self) -> Duration {
        self.segments.iter().map(|s| s.target_duration).sum()
    }

    /// Narration text of all segments, in order
    pub fn narration(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One on-screen caption shown from `start` to `end`
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionCue {
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

/// Placement of one synthesized segment inside the merged track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentTiming {
    pub index: usize,

    #[serde(with = "duration_secs")]
    pub start: Duration,

    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Audio file of this segment alone
    pub path: PathBuf,
}

impl SegmentTiming {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Voice track aligned 1:1 with the script segments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub path: PathBuf,

    #[serde(with = "duration_secs")]
    pub duration: Duration,

    pub voice: String,
    pub segments: Vec<SegmentTiming>,
}

/// Pixel dimensions of a rendered video or image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// 9:16 vertical format used for shorts
    pub const PORTRAIT_1080: Resolution = Resolution {
        width: 1080,
        height: 1920,
    };

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Composed vertical video plus its thumbnail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoArtifact {
    pub path: PathBuf,
    pub resolution: Resolution,

    #[serde(with = "duration_secs")]
    pub duration: Duration,

    pub thumbnail: PathBuf,

    /// SubRip file with the timed captions burned into the video
    #[serde(default)]
    pub captions: PathBuf,

    /// Image used for each segment, in segment order
    pub images: Vec<PathBuf>,
}

/// Visibility of an uploaded video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Unlisted,
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Unlisted => "unlisted",
            Self::Public => "public",
        }
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Private
    }
}

/// Metadata applied to an upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub category_id: String,
    pub language: String,
}

/// Outcome of a successful publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub remote_id: String,
    pub url: String,
    pub visibility: Visibility,
    pub metadata: VideoMetadata,
    pub idempotency_key: String,
    pub published_at: DateTime<Utc>,
}

/// Serialize durations as fractional seconds
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
