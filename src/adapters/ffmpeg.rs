//! ffmpeg-based renderer.
//!
//! Each still is looped for the length of its audio segment, scaled and
//! cropped to the portrait frame, branded, overlaid with its timed caption
//! cues, then concatenated and muxed with the narration track. Caption and
//! branding text is written to files and referenced with `textfile=` so no
//! user text ever needs filter-graph escaping.
//!
//! The encoder writes to a staging file that is renamed into place only
//! after ffprobe has measured it, so an abandoned attempt never clobbers
//! the output of the next one.
//!
//! Runs synchronously; callers move it onto the blocking pool.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{RenderError, RenderOutput, RenderPlan, Renderer, ThumbnailPlan};
use crate::domain::Resolution;

/// ffprobe arguments producing `{"format": {"duration": ...}, "streams": [...]}`
pub const PROBE_ARGS: [&str; 6] = [
    "-v",
    "quiet",
    "-print_format",
    "json",
    "-show_format",
    "-show_streams",
];

const CAPTION_LINE_CHARS: usize = 24;
const TITLE_CARD_COLOR: &str = "0x1a1a2e";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Extract the container duration from ffprobe JSON output
pub fn parse_probe_duration(stdout: &[u8]) -> Option<Duration> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    let secs = probe.format.duration?.parse::<f64>().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Frame size of the first video stream in ffprobe JSON output
pub fn parse_probe_resolution(stdout: &[u8]) -> Option<Resolution> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    probe
        .streams
        .into_iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .and_then(|stream| {
            Some(Resolution {
                width: stream.width?,
                height: stream.height?,
            })
        })
}

/// Wait for `child`, killing it as soon as `cancel` fires
fn wait_or_kill(child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus, RenderError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            if let Err(e) = child.kill() {
                warn!(error = %e, "Failed to kill encoder");
            }
            let _ = child.wait();
            return Err(RenderError::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// `video.mp4` -> `video.<id>.part.mp4`, next to the final output
fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let extension = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".to_string());
    output.with_file_name(format!("{}.{}.part.{}", stem, Uuid::new_v4().simple(), extension))
}

pub struct FfmpegRenderer {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegRenderer {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<(), RenderError> {
        debug!(binary = %self.ffmpeg_path, args = args.len(), "Running ffmpeg");
        let mut child = Command::new(&self.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drained on its own thread so a chatty encoder never blocks on the pipe
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let status = wait_or_kill(&mut child, cancel)?;
        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(RenderError::Failed(format!(
                "ffmpeg exited with code {}: {}",
                status.code().unwrap_or(-1),
                super::truncate(stderr.trim(), 500)
            )));
        }
        Ok(())
    }

    fn probe(&self, path: &Path) -> Result<RenderOutput, RenderError> {
        let output = Command::new(&self.ffprobe_path)
            .args(PROBE_ARGS)
            .arg(path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(RenderError::Failed(format!(
                "ffprobe failed on {}",
                path.display()
            )));
        }
        let duration = parse_probe_duration(&output.stdout)
            .ok_or_else(|| RenderError::Failed("ffprobe reported no duration".to_string()))?;
        let resolution = parse_probe_resolution(&output.stdout)
            .ok_or_else(|| RenderError::Failed("ffprobe reported no video stream".to_string()))?;
        Ok(RenderOutput { duration, resolution })
    }

    fn encode(&self, plan: &RenderPlan, staging: &Path, cancel: &CancellationToken) -> Result<RenderOutput, RenderError> {
        let text_dir = work_dir(&plan.output).join("text");
        std::fs::create_dir_all(&text_dir)?;

        let branding_file = text_dir.join("branding.txt");
        std::fs::write(&branding_file, &plan.branding)?;

        let mut caption_files = Vec::with_capacity(plan.clips.len());
        for (clip_index, clip) in plan.clips.iter().enumerate() {
            let mut files = Vec::with_capacity(clip.captions.len());
            for (cue_index, cue) in clip.captions.iter().enumerate() {
                let path = text_dir.join(format!("caption_{:02}_{:02}.txt", clip_index, cue_index));
                std::fs::write(&path, wrap_caption(&cue.text, CAPTION_LINE_CHARS))?;
                files.push(path);
            }
            caption_files.push(files);
        }

        let args = render_args(plan, &caption_files, &branding_file, staging);
        self.run(&args, cancel)?;
        self.probe(staging)
    }
}

impl Renderer for FfmpegRenderer {
    fn render(&self, plan: &RenderPlan, cancel: &CancellationToken) -> Result<RenderOutput, RenderError> {
        if plan.clips.is_empty() {
            return Err(RenderError::Failed("render plan has no clips".to_string()));
        }

        let staging = staging_path(&plan.output);
        let result = self.encode(plan, &staging, cancel);
        match result {
            Ok(measured) => {
                std::fs::rename(&staging, &plan.output)?;
                Ok(measured)
            }
            Err(err) => {
                let _ = std::fs::remove_file(&staging);
                Err(err)
            }
        }
    }

    fn render_thumbnail(&self, plan: &ThumbnailPlan, cancel: &CancellationToken) -> Result<(), RenderError> {
        let text_dir = work_dir(&plan.output).join("text");
        std::fs::create_dir_all(&text_dir)?;

        let title_file = text_dir.join("thumbnail_title.txt");
        std::fs::write(&title_file, wrap_caption(&plan.title, CAPTION_LINE_CHARS - 6))?;

        self.run(&thumbnail_args(plan, &title_file), cancel)
    }
}

fn work_dir(output: &Path) -> PathBuf {
    output
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn frame_filter(resolution: Resolution) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1",
        w = resolution.width,
        h = resolution.height
    )
}

fn font_option(font_file: Option<&Path>) -> String {
    font_file
        .map(|f| format!(":fontfile='{}'", escape_filter_path(f)))
        .unwrap_or_default()
}

/// `caption_files[i][j]` holds the text of cue `j` of clip `i`
fn render_args(plan: &RenderPlan, caption_files: &[Vec<PathBuf>], branding_file: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];

    for clip in &plan.clips {
        args.extend([
            "-loop".into(),
            "1".into(),
            "-t".into(),
            format!("{:.3}", clip.duration.as_secs_f64()),
            "-i".into(),
            clip.image.display().to_string(),
        ]);
    }
    let audio_index = plan.clips.len();
    args.extend(["-i".into(), plan.audio.display().to_string()]);

    let font = font_option(plan.font_file.as_deref());
    let mut graph = String::new();
    for (index, clip) in plan.clips.iter().enumerate() {
        graph.push_str(&format!(
            "[{i}:v]{frame},fps={fps},format=yuv420p,\
             drawtext=textfile='{brand}'{font}:fontcolor=white@0.85:fontsize=42:\
             x=(w-text_w)/2:y=h*0.07",
            i = index,
            frame = frame_filter(plan.resolution),
            fps = plan.fps,
            brand = escape_filter_path(branding_file),
            font = font,
        ));

        let files = caption_files.get(index).map(Vec::as_slice).unwrap_or_default();
        for (cue, file) in clip.captions.iter().zip(files) {
            graph.push_str(&format!(
                ",drawtext=textfile='{caption}'{font}:fontcolor=white:fontsize=72:line_spacing=12:\
                 borderw=4:bordercolor=black:x=(w-text_w)/2:y=h*0.68:\
                 enable='between(t,{start:.3},{end:.3})'",
                caption = escape_filter_path(file),
                font = font,
                start = cue.start.as_secs_f64(),
                end = cue.end.as_secs_f64(),
            ));
        }
        graph.push_str(&format!("[v{}];", index));
    }
    for index in 0..plan.clips.len() {
        graph.push_str(&format!("[v{}]", index));
    }
    graph.push_str(&format!("concat=n={}:v=1:a=0[outv]", plan.clips.len()));

    args.extend([
        "-filter_complex".into(),
        graph,
        "-map".into(),
        "[outv]".into(),
        "-map".into(),
        format!("{}:a", audio_index),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-r".into(),
        plan.fps.to_string(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-shortest".into(),
        output.display().to_string(),
    ]);
    args
}

fn thumbnail_args(plan: &ThumbnailPlan, title_file: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];

    match &plan.image {
        Some(image) => args.extend(["-i".into(), image.display().to_string()]),
        None => args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("color=c={}:s={}", TITLE_CARD_COLOR, plan.resolution),
        ]),
    }

    let filter = format!(
        "{frame},drawtext=textfile='{title}'{font}:fontcolor=white:fontsize=96:line_spacing=16:\
         box=1:boxcolor=black@0.6:boxborderw=32:x=(w-text_w)/2:y=(h-text_h)/2",
        frame = frame_filter(plan.resolution),
        title = escape_filter_path(title_file),
        font = font_option(plan.font_file.as_deref()),
    );

    args.extend([
        "-vf".into(),
        filter,
        "-frames:v".into(),
        "1".into(),
        plan.output.display().to_string(),
    ]);
    args
}

/// Escape a path for use inside a quoted filter option
fn escape_filter_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// Greedy word wrap for drawtext, which does not wrap on its own
fn wrap_caption(text: &str, width: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines.join("\n")
}
