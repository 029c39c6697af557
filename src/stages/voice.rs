//! Voice synthesis stage.
//!
//! Segments are synthesized independently with bounded parallelism; the
//! merged track keeps script order regardless of completion order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument};

use crate::adapters::{SynthesizedClip, VoiceBackend, VoiceError};
use crate::config::VoiceSettings;
use crate::core::policy::retry_with_backoff;
use crate::domain::{AudioArtifact, ScriptArtifact, SegmentTiming};
use crate::error::{PipelineError, PipelineResult};
use crate::themes::LanguageProfile;

pub const MERGED_AUDIO_FILE: &str = "voice.mp3";

pub struct VoiceSynthesizer {
    backend: Arc<dyn VoiceBackend>,
    settings: VoiceSettings,
}

impl VoiceSynthesizer {
    pub fn new(backend: Arc<dyn VoiceBackend>, settings: VoiceSettings) -> Self {
        Self { backend, settings }
    }

    /// Voice for a language: explicit table entry first, then the profile
    pub fn select_voice(&self, language: &str, profile: &LanguageProfile) -> String {
        if let Some(voice) = self.settings.voices.get(language) {
            return voice.clone();
        }
        if self.settings.female {
            profile.voice_female.clone()
        } else {
            profile.voice.clone()
        }
    }

    /// Synthesize every segment of `script` into `output_dir`
    #[instrument(skip_all, fields(backend = %self.backend.name(), voice = %voice, segments = script.segments.len()))]
    pub async fn synthesize(
        &self,
        script: &ScriptArtifact,
        voice: &str,
        output_dir: &Path,
    ) -> PipelineResult<AudioArtifact> {
        tokio::fs::create_dir_all(output_dir).await?;

        let parallel = self.settings.max_parallel_segments.max(1);
        let pending: Vec<_> = script
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| self.synthesize_segment(index, &segment.text, voice))
            .collect();
        let results: Vec<Result<SynthesizedClip, PipelineError>> =
            stream::iter(pending).buffered(parallel).collect().await;

        // Any failed segment fails the whole stage
        let mut clips = Vec::with_capacity(results.len());
        for result in results {
            clips.push(result?);
        }

        let mut segments = Vec::with_capacity(clips.len());
        let mut merged = Vec::new();
        let mut offset = Duration::ZERO;

        for (index, clip) in clips.iter().enumerate() {
            let path = output_dir.join(format!("voice_{:02}.mp3", index));
            tokio::fs::write(&path, &clip.audio).await?;
            merged.extend_from_slice(&clip.audio);

            segments.push(SegmentTiming {
                index,
                start: offset,
                duration: clip.duration,
                path,
            });
            offset += clip.duration;
        }

        let path = output_dir.join(MERGED_AUDIO_FILE);
        tokio::fs::write(&path, &merged).await?;

        info!(
            duration_secs = offset.as_secs_f64(),
            segments = segments.len(),
            "Voice track synthesized"
        );

        Ok(AudioArtifact {
            path,
            duration: offset,
            voice: voice.to_string(),
            segments,
        })
    }

    async fn synthesize_segment(
        &self,
        index: usize,
        text: &str,
        voice: &str,
    ) -> PipelineResult<SynthesizedClip> {
        let backend = &self.backend;
        let label = format!("synthesize_segment_{}", index);

        let clip = retry_with_backoff(
            &self.settings.segment_retry,
            &label,
            |_| backend.synthesize(text, voice),
            VoiceError::is_transient,
        )
        .await
        .map_err(|(err, attempts)| PipelineError::SynthesisFailed {
            segment: index,
            attempts,
            message: err.to_string(),
        })?;

        if clip.audio.is_empty() || clip.duration.is_zero() {
            return Err(PipelineError::SynthesisFailed {
                segment: index,
                attempts: 1,
                message: "backend returned empty audio".to_string(),
            });
        }

        debug!(segment = index, duration_ms = clip.duration.as_millis() as u64, "Segment synthesized");
        Ok(clip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl VoiceBackend for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn synthesize(&self, _text: &str, _voice: &str) -> Result<SynthesizedClip, VoiceError> {
            Ok(SynthesizedClip {
                audio: vec![0],
                duration: Duration::from_secs(1),
            })
        }
    }

    fn profile() -> LanguageProfile {
        LanguageProfile {
            name: "Español".to_string(),
            voice: "es-ES-AlvaroNeural".to_string(),
            voice_female: "es-ES-ElviraNeural".to_string(),
            hashtags: vec![],
        }
    }

    #[test]
    fn test_select_voice() {
        let mut settings = VoiceSettings::default();
        let synth = VoiceSynthesizer::new(Arc::new(Silent), settings.clone());
        assert_eq!(synth.select_voice("es", &profile()), "es-ES-AlvaroNeural");

        settings.female = true;
        let synth = VoiceSynthesizer::new(Arc::new(Silent), settings.clone());
        assert_eq!(synth.select_voice("es", &profile()), "es-ES-ElviraNeural");

        settings.voices = HashMap::from([("es".to_string(), "es-MX-JorgeNeural".to_string())]);
        let synth = VoiceSynthesizer::new(Arc::new(Silent), settings);
        assert_eq!(synth.select_voice("es", &profile()), "es-MX-JorgeNeural");
    }
}
