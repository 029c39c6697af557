//! Pipeline stages.
//!
//! Each stage turns the previous stage's artifact into its own, talking
//! to the outside world only through the traits in [`crate::adapters`].
//! Stages never see a [`Job`](crate::domain::Job); the orchestrator hands
//! them the inputs they need and records the outcome.

pub mod captions;
pub mod publish;
pub mod script;
pub mod visual;
pub mod voice;

pub use captions::{script_cues, segment_cues, to_srt};
pub use publish::{build_metadata, PublishLedger, Publisher};
pub use script::{ScriptGenerator, ScriptRequest};
pub use visual::{ComposeRequest, VisualComposer};
pub use voice::VoiceSynthesizer;
