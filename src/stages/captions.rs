//! Timed caption cues.
//!
//! Each narration segment is split into short word groups that are shown
//! one after another across the segment's audio window. Time is shared
//! out by word count, so longer groups stay on screen longer.

use std::fmt::Write as _;
use std::time::Duration;

use crate::domain::{AudioArtifact, CaptionCue, ScriptArtifact};

pub const CAPTIONS_FILE: &str = "captions.srt";

/// Segments longer than this get groups one word shorter
const LONG_SEGMENT_WORDS: usize = 20;

/// Cues for one segment spoken from `start` for `duration`
pub fn segment_cues(text: &str, start: Duration, duration: Duration, words_per_cue: usize) -> Vec<CaptionCue> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let mut group = words_per_cue.max(1);
    if words.len() > LONG_SEGMENT_WORDS && group > 1 {
        group -= 1;
    }

    let per_word = duration.as_secs_f64() / words.len() as f64;
    let end_of_segment = start + duration;
    let at = |word_index: usize| start + Duration::from_secs_f64(per_word * word_index as f64);

    let chunks: Vec<&[&str]> = words.chunks(group).collect();
    let last = chunks.len() - 1;
    let mut consumed = 0;

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let cue_start = at(consumed);
            consumed += chunk.len();
            let cue_end = if index == last { end_of_segment } else { at(consumed) };
            CaptionCue {
                start: cue_start,
                end: cue_end,
                text: chunk.join(" "),
            }
        })
        .collect()
}

/// Cues for the whole video, on the merged audio timeline
pub fn script_cues(script: &ScriptArtifact, audio: &AudioArtifact, words_per_cue: usize) -> Vec<CaptionCue> {
    script
        .segments
        .iter()
        .zip(&audio.segments)
        .flat_map(|(segment, timing)| segment_cues(&segment.text, timing.start, timing.duration, words_per_cue))
        .collect()
}

/// Render cues as SubRip text
pub fn to_srt(cues: &[CaptionCue]) -> String {
    let mut out = String::new();
    for (index, cue) in cues.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            srt_timestamp(cue.start),
            srt_timestamp(cue.end),
            cue.text
        );
    }
    out
}

fn srt_timestamp(at: Duration) -> String {
    let millis = at.as_millis();
    format!(
        "{:02}:{:02}:{:02},{:03}",
        millis / 3_600_000,
        (millis / 60_000) % 60,
        (millis / 1000) % 60,
        millis % 1000
    )
}
