//! Visual composition stage.
//!
//! One image per narration segment, shown for exactly the length of its
//! synthesized audio, with word-group captions timed across each segment.
//! Encoding runs on the blocking pool and is cancelled when the stage stops
//! waiting for it; renderer errors are final for the stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{
    ImageError, ImageRef, ImageSource, RenderClip, RenderError, RenderOutput, RenderPlan, Renderer,
    ThumbnailPlan,
};
use crate::config::VisualSettings;
use crate::core::policy::retry_with_backoff;
use crate::domain::{AudioArtifact, ScriptArtifact, VideoArtifact};
use crate::error::{PipelineError, PipelineResult};
use crate::stages::captions::{script_cues, segment_cues, to_srt, CAPTIONS_FILE};

pub const VIDEO_FILE: &str = "video.mp4";
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

const SEARCH_RESULTS: usize = 5;

/// Branding and title drawn on the video
#[derive(Debug, Clone)]
pub struct ComposeRequest<'a> {
    pub script: &'a ScriptArtifact,
    pub audio: &'a AudioArtifact,
    pub branding: &'a str,
    pub output_dir: &'a Path,
}

/// Image stored for one segment
#[derive(Debug, Clone)]
struct AcquiredImage {
    path: PathBuf,
    pixels: u64,
}

pub struct VisualComposer {
    images: Arc<dyn ImageSource>,
    renderer: Arc<dyn Renderer>,
    settings: VisualSettings,
}

impl VisualComposer {
    pub fn new(images: Arc<dyn ImageSource>, renderer: Arc<dyn Renderer>, settings: VisualSettings) -> Self {
        Self {
            images,
            renderer,
            settings,
        }
    }

    #[instrument(skip_all, fields(source = %self.images.name(), segments = request.script.segments.len()))]
    pub async fn compose(&self, request: ComposeRequest<'_>) -> PipelineResult<VideoArtifact> {
        let ComposeRequest {
            script,
            audio,
            branding,
            output_dir,
        } = request;

        if script.segments.len() != audio.segments.len() {
            return Err(PipelineError::EncodingFailed(format!(
                "script has {} segments but audio has {}",
                script.segments.len(),
                audio.segments.len()
            )));
        }

        tokio::fs::create_dir_all(output_dir).await?;

        // (a) one image per segment
        let images = try_join_all(
            script
                .segments
                .iter()
                .enumerate()
                .map(|(index, segment)| self.acquire_image(index, &segment.keywords, output_dir)),
        )
        .await?;

        // (b)-(d) still per segment, captions, branding, portrait encode
        let clips = script
            .segments
            .iter()
            .zip(&audio.segments)
            .zip(&images)
            .map(|((segment, timing), image)| RenderClip {
                image: image.path.clone(),
                duration: timing.duration,
                captions: segment_cues(
                    &segment.text,
                    Duration::ZERO,
                    timing.duration,
                    self.settings.caption_words,
                ),
            })
            .collect();

        let captions = output_dir.join(CAPTIONS_FILE);
        let cues = script_cues(script, audio, self.settings.caption_words);
        tokio::fs::write(&captions, to_srt(&cues)).await?;

        let font_file = self.settings.font_file.as_ref().map(PathBuf::from);
        let plan = RenderPlan {
            output: output_dir.join(VIDEO_FILE),
            audio: audio.path.clone(),
            clips,
            resolution: self.settings.resolution,
            fps: self.settings.fps,
            branding: branding.to_string(),
            font_file: font_file.clone(),
        };

        let rendered = self.render(plan.clone()).await?;
        self.validate(&rendered, audio.duration)?;

        // (e) thumbnail from the largest image, title card as a fallback
        let best = images.iter().max_by_key(|image| image.pixels).map(|i| i.path.clone());
        let thumbnail = ThumbnailPlan {
            output: output_dir.join(THUMBNAIL_FILE),
            image: best,
            title: script.title.clone(),
            resolution: self.settings.resolution,
            font_file,
        };
        self.render_thumbnail(thumbnail.clone()).await?;

        info!(
            duration_secs = rendered.duration.as_secs_f64(),
            resolution = %rendered.resolution,
            "Video composed"
        );

        Ok(VideoArtifact {
            path: plan.output,
            resolution: rendered.resolution,
            duration: rendered.duration,
            thumbnail: thumbnail.output,
            captions,
            images: images.into_iter().map(|i| i.path).collect(),
        })
    }

    async fn acquire_image(&self, index: usize, keywords: &str, dir: &Path) -> PipelineResult<AcquiredImage> {
        let fallback = self.settings.fallback_query.as_str();
        let path = dir.join(format!("image_{:02}.jpg", index));

        for query in [keywords, fallback] {
            if query.trim().is_empty() {
                continue;
            }
            let candidates = self.search(query).await?;
            if candidates.is_empty() {
                debug!(segment = index, query, "No images for query");
                continue;
            }

            for candidate in candidates {
                match self.fetch(&candidate).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        tokio::fs::write(&path, &bytes).await?;
                        debug!(segment = index, query, image = %candidate.id, "Image acquired");
                        return Ok(AcquiredImage {
                            path,
                            pixels: candidate.pixels(),
                        });
                    }
                    Ok(_) => warn!(segment = index, image = %candidate.id, "Image download was empty"),
                    Err(e) => warn!(segment = index, image = %candidate.id, error = %e, "Image download failed"),
                }
            }
        }

        Err(PipelineError::ImageSourceExhausted {
            segment: index,
            query: keywords.to_string(),
            fallback: fallback.to_string(),
        })
    }

    /// Largest candidates first. A rejected query counts as a miss.
    async fn search(&self, query: &str) -> PipelineResult<Vec<ImageRef>> {
        let images = &self.images;
        let result = retry_with_backoff(
            &self.settings.image_retry,
            "image_search",
            |_| images.search(query, SEARCH_RESULTS),
            ImageError::is_transient,
        )
        .await;

        match result {
            Ok(mut found) => {
                found.sort_by_key(|image| std::cmp::Reverse(image.pixels()));
                Ok(found)
            }
            Err((err @ ImageError::Unavailable(_), attempts)) => Err(PipelineError::ImageSourceUnavailable(
                format!("{} (after {} attempts)", err, attempts),
            )),
            Err((err, _)) => {
                warn!(query, error = %err, "Image search rejected");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, ImageError> {
        let images = &self.images;
        retry_with_backoff(
            &self.settings.image_retry,
            "image_fetch",
            |_| images.fetch(image),
            ImageError::is_transient,
        )
        .await
        .map_err(|(err, _)| err)
    }

    /// Dropping the returned future (stage timeout, cancelled job) fires
    /// the renderer's cancel token.
    async fn render(&self, plan: RenderPlan) -> PipelineResult<RenderOutput> {
        let renderer = Arc::clone(&self.renderer);
        let cancel = CancellationToken::new();
        let _stop_on_drop = cancel.clone().drop_guard();

        tokio::task::spawn_blocking(move || renderer.render(&plan, &cancel))
            .await
            .map_err(|e| PipelineError::EncodingFailed(format!("render task aborted: {}", e)))?
            .map_err(encoding_failed)
    }

    async fn render_thumbnail(&self, plan: ThumbnailPlan) -> PipelineResult<()> {
        let renderer = Arc::clone(&self.renderer);
        let cancel = CancellationToken::new();
        let _stop_on_drop = cancel.clone().drop_guard();

        tokio::task::spawn_blocking(move || {
            renderer.render_thumbnail(&plan, &cancel).or_else(|err| {
                if plan.image.is_none() || cancel.is_cancelled() {
                    return Err(err);
                }
                warn!(error = %err, "Thumbnail from image failed, using title card");
                let card = ThumbnailPlan { image: None, ..plan };
                renderer.render_thumbnail(&card, &cancel)
            })
        })
        .await
        .map_err(|e| PipelineError::EncodingFailed(format!("thumbnail task aborted: {}", e)))?
        .map_err(encoding_failed)
    }

    fn validate(&self, rendered: &RenderOutput, audio_duration: Duration) -> PipelineResult<()> {
        if !rendered.resolution.is_portrait() || rendered.resolution != self.settings.resolution {
            return Err(PipelineError::EncodingFailed(format!(
                "encoded resolution {} does not match {}",
                rendered.resolution, self.settings.resolution
            )));
        }

        let drift = (rendered.duration.as_secs_f64() - audio_duration.as_secs_f64()).abs();
        if drift > self.settings.duration_tolerance_secs {
            return Err(PipelineError::EncodingFailed(format!(
                "video is {:.2}s but audio is {:.2}s",
                rendered.duration.as_secs_f64(),
                audio_duration.as_secs_f64()
            )));
        }
        Ok(())
    }
}

fn encoding_failed(err: RenderError) -> PipelineError {
    PipelineError::EncodingFailed(err.to_string())
}
