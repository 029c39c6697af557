//! Voice synthesis through the `edge-tts` CLI.
//!
//! Spawns `edge-tts --voice <voice> --text <text> --write-media <file>`,
//! then measures the result with `ffprobe`. The reported duration always
//! comes from the probe, never from the text.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

use super::ffmpeg::{parse_probe_duration, PROBE_ARGS};
use super::{SynthesizedClip, VoiceBackend, VoiceError};

pub struct EdgeTtsVoice {
    binary_path: String,
    ffprobe_path: String,
    scratch_dir: PathBuf,
    call_timeout: Duration,
}

impl EdgeTtsVoice {
    pub fn new(binary_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            ffprobe_path: ffprobe_path.into(),
            scratch_dir: std::env::temp_dir(),
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    async fn run_edge_tts(&self, text: &str, voice: &str, output: &Path) -> Result<(), VoiceError> {
        let child = Command::new(&self.binary_path)
            .arg("--voice")
            .arg(voice)
            .arg("--text")
            .arg(text)
            .arg("--write-media")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VoiceError::Unavailable(format!("failed to spawn {}: {}", self.binary_path, e))
            })?;

        let output_status = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Unavailable(format!("edge-tts timed out after {:?}", self.call_timeout))
            })?
            .map_err(|e| VoiceError::Unavailable(format!("failed to wait for edge-tts: {}", e)))?;

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            let message = format!(
                "edge-tts exited with code {}: {}",
                output_status.status.code().unwrap_or(-1),
                stderr.trim()
            );
            // edge-tts reports unknown voices on stderr; nothing to retry there
            if stderr.contains("Invalid voice") || stderr.contains("No voice") {
                return Err(VoiceError::Rejected(message));
            }
            return Err(VoiceError::Unavailable(message));
        }

        Ok(())
    }

    async fn probe(&self, path: &Path) -> Result<Duration, VoiceError> {
        let output = Command::new(&self.ffprobe_path)
            .args(PROBE_ARGS)
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VoiceError::Unavailable(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(VoiceError::Unavailable(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_probe_duration(&output.stdout)
            .ok_or_else(|| VoiceError::Unavailable("ffprobe reported no duration".to_string()))
    }
}

#[async_trait]
impl VoiceBackend for EdgeTtsVoice {
    fn name(&self) -> &str {
        "edge-tts"
    }

    async fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedClip, VoiceError> {
        let scratch = self.scratch_dir.join(format!("shortforge-tts-{}.mp3", Uuid::new_v4()));

        let result = async {
            self.run_edge_tts(text, voice, &scratch).await?;
            let duration = self.probe(&scratch).await?;
            let audio = tokio::fs::read(&scratch)
                .await
                .map_err(|e| VoiceError::Unavailable(format!("failed to read synthesized audio: {}", e)))?;
            Ok::<_, VoiceError>(SynthesizedClip { audio, duration })
        }
        .await;

        let _ = tokio::fs::remove_file(&scratch).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_transient() {
        let voice = EdgeTtsVoice::new("/nonexistent/edge-tts", "/nonexistent/ffprobe");
        let err = voice.synthesize("hola", "es-ES-AlvaroNeural").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_custom_scratch_dir() {
        let voice = EdgeTtsVoice::new("edge-tts", "ffprobe").with_scratch_dir("/tmp/sf");
        assert_eq!(voice.scratch_dir, PathBuf::from("/tmp/sf"));
        assert_eq!(voice.name(), "edge-tts");
    }
}
