//! Script generation and validation.
//!
//! The backend is asked for a loosely structured script (title, hook,
//! numbered points, outro, hashtags). Parsing is best-effort: section
//! markers may come bracketed (`[HOOK]`), with a colon (`Hook:`), in
//! several languages, or as plain numbered lines (`1. ...`, `2) ...`).
//! Output that still cannot be read is regenerated a bounded number of
//! times before the stage reports `GenerationMalformed`.
//!
//! Once parsed, the narration estimate must fall inside the theme's
//! duration bounds. A miss triggers exactly one re-invocation with a
//! shorten/expand instruction; a second miss is `DurationOutOfBounds`.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{BackendError, TextBackend};
use crate::config::GenerationSettings;
use crate::core::policy::retry_with_backoff;
use crate::domain::{NarrationSegment, ScriptArtifact, SegmentKind};
use crate::error::{PipelineError, PipelineResult};
use crate::themes::DurationBounds;

const MAX_TITLE_CHARS: usize = 100;
const MAX_HASHTAGS: usize = 15;

static BRACKET_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^\[\s*({})\s*(\d+)?\s*\]\s*[:.\-]?\s*(.*)$", MARKER_WORDS))
        .expect("valid regex")
});

static COLON_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^({})\s*(\d+)?\s*[:\-]\s*(.*)$", MARKER_WORDS)).expect("valid regex")
});

static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\s*[.)]\s+(.+)$").expect("valid regex"));

static HASHTAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#[\p{L}\p{N}_]+").expect("valid regex"));

static TIMING_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\(\[]\s*\d+(?:[.,]\d+)?\s*(?:-\s*\d+\s*)?(?:s|seg|segundos|sec|secs|seconds)\s*[\)\]]")
        .expect("valid regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

const MARKER_WORDS: &str = "t[ií]tulo|title|titre|titolo|titel|hook|gancho|intro|\
                            point|punto|ponto|dato|fact|outro|cta|cierre|conclusi[oó]n|hashtags";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Title,
    Hook,
    Point(u32),
    Outro,
    Hashtags,
}

fn section_for(word: &str, number: Option<u32>, next_point: u32) -> Section {
    match word.to_lowercase().as_str() {
        "title" | "título" | "titulo" | "titre" | "titolo" | "titel" => Section::Title,
        "hook" | "gancho" | "intro" => Section::Hook,
        "outro" | "cta" | "cierre" | "conclusion" | "conclusión" => Section::Outro,
        "hashtags" => Section::Hashtags,
        _ => Section::Point(number.unwrap_or(next_point)),
    }
}

/// Structured content recovered from raw backend text
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScript {
    pub title: String,
    pub hook: String,
    pub points: Vec<(u32, String)>,
    pub outro: String,
    pub hashtags: Vec<String>,
}

/// Best-effort parse; the error string says what could not be located
pub fn parse_script(raw: &str, min_points: usize) -> Result<ParsedScript, String> {
    let mut sections: Vec<(Section, String)> = Vec::new();
    let mut hashtags: Vec<String> = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // A bare hashtag line, anywhere
        if line.starts_with('#') && line.chars().nth(1).is_some_and(char::is_alphanumeric) {
            collect_hashtags(line, &mut hashtags);
            continue;
        }

        let normalized = line
            .trim_start_matches(|c: char| c == '#' || c == '*' || c == '-' || c.is_whitespace())
            .replace("**", "");
        let next_point = sections
            .iter()
            .filter(|(s, _)| matches!(s, Section::Point(_)))
            .count() as u32
            + 1;

        let marker = BRACKET_MARKER
            .captures(&normalized)
            .or_else(|| COLON_MARKER.captures(&normalized));

        if let Some(caps) = marker {
            let number = caps.get(2).and_then(|m| m.as_str().parse().ok());
            let section = section_for(&caps[1], number, next_point);
            let rest = caps.get(3).map_or("", |m| m.as_str()).trim().to_string();
            if section == Section::Hashtags {
                collect_hashtags(&rest, &mut hashtags);
            }
            sections.push((section, rest));
        } else if let Some(caps) = NUMBERED_LINE.captures(&normalized) {
            let number = caps[1].parse().unwrap_or(next_point);
            sections.push((Section::Point(number), caps[2].trim().to_string()));
        } else if let Some((section, text)) = sections.last_mut() {
            if *section == Section::Hashtags {
                collect_hashtags(&normalized, &mut hashtags);
            } else {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&normalized);
            }
        }
        // Preamble before the first marker is ignored
    }

    let take = |wanted: Section| {
        sections
            .iter()
            .find(|(s, t)| *s == wanted && !clean_for_speech(t).is_empty())
            .map(|(_, t)| t.clone())
    };

    let title = take(Section::Title).ok_or("no title section")?;
    let hook = take(Section::Hook).ok_or("no hook section")?;
    let outro = take(Section::Outro).ok_or("no outro section")?;

    let points: Vec<(u32, String)> = sections
        .iter()
        .filter_map(|(s, t)| match s {
            Section::Point(n) if !clean_for_speech(t).is_empty() => Some((*n, t.clone())),
            _ => None,
        })
        .collect();

    if points.len() < min_points {
        return Err(format!(
            "found {} numbered points, need at least {}",
            points.len(),
            min_points
        ));
    }

    Ok(ParsedScript {
        title: clean_title(&title),
        hook,
        points,
        outro,
        hashtags,
    })
}

fn collect_hashtags(text: &str, out: &mut Vec<String>) {
    for tag in HASHTAG.find_iter(text) {
        let tag = tag.as_str().to_string();
        if !out.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            out.push(tag);
        }
    }
}

fn clean_title(title: &str) -> String {
    let cleaned = title.replace(['*', '"'], "");
    cleaned.trim().chars().take(MAX_TITLE_CHARS).collect()
}

/// Strip markdown, timing hints and ellipses so the text reads naturally
pub fn clean_for_speech(text: &str) -> String {
    let without_hints = TIMING_HINT.replace_all(text, " ");
    let without_hashtags = HASHTAG.replace_all(&without_hints, " ");
    let stripped: String = without_hashtags
        .replace("...", ".")
        .replace('…', ".")
        .chars()
        .filter(|c| !matches!(c, '*' | '#' | '[' | ']' | '_'))
        .collect();
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

/// Estimated speaking time at `words_per_minute`
pub fn estimate_duration(text: &str, words_per_minute: f64) -> Duration {
    let words = text.split_whitespace().count() as f64;
    if words_per_minute <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(words / words_per_minute * 60.0)
}

/// Up to four significant words, used as the image query of a segment
fn keywords_for(text: &str, fallback: &str) -> String {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .take(4)
        .collect();
    if words.is_empty() {
        fallback.to_string()
    } else {
        words.join(" ")
    }
}

/// Inputs that stay fixed across the generation attempts of one job
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub prompt: String,
    pub topic: String,
    pub bounds: DurationBounds,
    /// Used when the backend produced no hashtags
    pub default_hashtags: Vec<String>,
}

pub struct ScriptGenerator {
    backend: Arc<dyn TextBackend>,
    settings: GenerationSettings,
}

impl ScriptGenerator {
    pub fn new(backend: Arc<dyn TextBackend>, settings: GenerationSettings) -> Self {
        Self { backend, settings }
    }

    /// Generate, parse and validate a script
    #[instrument(skip_all, fields(backend = %self.backend.name(), topic = %request.topic))]
    pub async fn generate(&self, request: &ScriptRequest) -> PipelineResult<ScriptArtifact> {
        let mut invocations = 0u32;

        let script = self
            .generate_parsed(&request.prompt, request, &mut invocations)
            .await?;
        let estimate = script.estimated_duration();

        if request.bounds.contains(estimate) {
            return Ok(finish(script, invocations));
        }

        let adjust = adjustment_instruction(estimate, request.bounds);
        warn!(
            estimated_secs = estimate.as_secs_f64(),
            min_secs = request.bounds.min_secs,
            max_secs = request.bounds.max_secs,
            "Script outside duration bounds, asking for one adjustment"
        );

        let adjusted_prompt = format!("{}\n\n{}", request.prompt, adjust);
        let script = self
            .generate_parsed(&adjusted_prompt, request, &mut invocations)
            .await?;
        let estimate = script.estimated_duration();

        if request.bounds.contains(estimate) {
            Ok(finish(script, invocations))
        } else {
            Err(PipelineError::DurationOutOfBounds {
                actual_secs: estimate.as_secs_f64(),
                min_secs: request.bounds.min_secs,
                max_secs: request.bounds.max_secs,
            })
        }
    }

    /// One prompt, retried for backend failures and regenerated for
    /// unparseable output
    async fn generate_parsed(
        &self,
        prompt: &str,
        request: &ScriptRequest,
        invocations: &mut u32,
    ) -> PipelineResult<ScriptArtifact> {
        let max_attempts = 1 + self.settings.max_regenerations;
        let max_tokens = self.settings.backend.max_tokens();

        for attempt in 1..=max_attempts {
            let raw = self.call_backend(prompt, max_tokens).await?;
            *invocations += 1;

            match parse_script(&raw, self.settings.min_points) {
                Ok(parsed) => {
                    debug!(attempt, points = parsed.points.len(), "Script parsed");
                    return Ok(self.build_artifact(parsed, &raw, request));
                }
                Err(reason) if attempt < max_attempts => {
                    warn!(attempt, reason = %reason, "Generated script malformed, regenerating");
                }
                Err(reason) => {
                    return Err(PipelineError::GenerationMalformed {
                        attempts: attempt,
                        reason,
                    });
                }
            }
        }

        Err(PipelineError::GenerationMalformed {
            attempts: max_attempts,
            reason: "no generation attempts configured".to_string(),
        })
    }

    async fn call_backend(&self, prompt: &str, max_tokens: u32) -> PipelineResult<String> {
        let backend = &self.backend;
        retry_with_backoff(
            &self.settings.backend_retry,
            "text_generation",
            |_| backend.generate(prompt, max_tokens),
            BackendError::is_transient,
        )
        .await
        .map_err(|(err, attempts)| PipelineError::BackendUnavailable {
            attempts,
            message: err.to_string(),
        })
    }

    fn build_artifact(&self, parsed: ParsedScript, raw: &str, request: &ScriptRequest) -> ScriptArtifact {
        let wpm = self.settings.words_per_minute;
        let segment = |kind: SegmentKind, text: &str| {
            let spoken = clean_for_speech(text);
            NarrationSegment {
                kind,
                keywords: keywords_for(&spoken, &request.topic),
                target_duration: estimate_duration(&spoken, wpm),
                text: spoken,
            }
        };

        let mut segments = Vec::with_capacity(parsed.points.len() + 2);
        segments.push(segment(SegmentKind::Hook, &parsed.hook));
        for (number, text) in &parsed.points {
            segments.push(segment(SegmentKind::Point(*number), text));
        }
        segments.push(segment(SegmentKind::Outro, &parsed.outro));

        let mut hashtags = parsed.hashtags;
        if hashtags.is_empty() {
            hashtags = request.default_hashtags.clone();
        }
        hashtags.truncate(MAX_HASHTAGS);

        ScriptArtifact {
            title: parsed.title,
            segments,
            hashtags,
            raw_chars: raw.chars().count(),
            generation_attempts: 0,
        }
    }
}

fn finish(mut script: ScriptArtifact, invocations: u32) -> ScriptArtifact {
    script.generation_attempts = invocations;
    info!(
        title = %script.title,
        segments = script.segments.len(),
        estimated_secs = script.estimated_duration().as_secs_f64(),
        invocations,
        "Script generated"
    );
    script
}

fn adjustment_instruction(estimate: Duration, bounds: DurationBounds) -> String {
    let target = (bounds.min_secs + bounds.max_secs) / 2;
    if estimate.as_secs_f64() > f64::from(bounds.max_secs) {
        format!(
            "IMPORTANT: the previous script was too long (about {:.0} seconds). Rewrite it shorter, \
             about {} seconds of narration, keeping exactly the same structure.",
            estimate.as_secs_f64(),
            target
        )
    } else {
        format!(
            "IMPORTANT: the previous script was too short (about {:.0} seconds). Rewrite it longer, \
             about {} seconds of narration, keeping exactly the same structure.",
            estimate.as_secs_f64(),
            target
        )
    }
}
