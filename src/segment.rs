//! Sentence segmentation: turns raw recognition output into timed cue spans.
//!
//! Backends hand over one of three shapes — per-token timestamps, a whole
//! utterance with offset and duration, or a transcript plus word offsets —
//! and all of them split at the same sentence-ending punctuation.

use std::time::Duration;

/// Sentence-boundary punctuation. Text between two of these (or between the
/// stream edges and the nearest one) becomes one cue.
pub const SENTENCE_BREAKS: [char; 4] = ['，', '。', '？', '！'];

/// One timestamped text fragment from a recognition result.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedToken {
    pub text: String,
    pub start: Duration,
    pub end: Duration,
}

/// A cue's timing and text before an index is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct CueSpan {
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

/// Split at sentence punctuation, dropping fragments that trim to nothing.
pub fn split_fragments(text: &str) -> Vec<String> {
    text.split(SENTENCE_BREAKS.as_slice())
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// Group an ordered token list into cues at sentence punctuation.
///
/// A cue starts at its first constituent token's start time and ends at its
/// last one's end time. A break in the middle of a token closes the current
/// cue; the remainder of that token opens the next cue with the same token
/// timing.
pub fn segment_timed_tokens(tokens: &[TimedToken]) -> Vec<CueSpan> {
    let mut cues = Vec::new();
    let mut text = String::new();
    let mut start = Duration::ZERO;
    let mut end = Duration::ZERO;

    for token in tokens {
        let parts: Vec<&str> = token.text.split(SENTENCE_BREAKS.as_slice()).collect();
        for (i, part) in parts.iter().enumerate() {
            let part = part.trim();
            if !part.is_empty() {
                if text.is_empty() {
                    start = token.start;
                }
                text.push_str(part);
                end = token.end;
            }
            // Every gap between parts was a sentence break.
            if i + 1 < parts.len() && !text.is_empty() {
                cues.push(CueSpan {
                    start,
                    end,
                    text: std::mem::take(&mut text),
                });
            }
        }
    }
    if !text.is_empty() {
        cues.push(CueSpan { start, end, text });
    }
    cues
}

/// Distribute an utterance's duration over its fragments by character count.
///
/// Each fragment's end is `start + duration * cumulative_chars / total_chars`,
/// computed cumulatively so the last fragment ends exactly at
/// `start + duration`. The next fragment begins where the previous ended.
pub fn segment_proportional(text: &str, start: Duration, duration: Duration) -> Vec<CueSpan> {
    let fragments = split_fragments(text);
    let total: usize = fragments.iter().map(|f| f.chars().count()).sum();
    if total == 0 {
        return Vec::new();
    }

    let mut cues = Vec::with_capacity(fragments.len());
    let mut cursor = start;
    let mut consumed = 0usize;
    for fragment in fragments {
        consumed += fragment.chars().count();
        let end = start + duration.mul_f64(consumed as f64 / total as f64);
        cues.push(CueSpan {
            start: cursor,
            end,
            text: fragment,
        });
        cursor = end;
    }
    cues
}

/// The whole utterance as a single cue, internal sentence punctuation
/// resolved into line breaks. `None` when nothing but whitespace remains.
pub fn segment_whole_utterance(text: &str, start: Duration, duration: Duration) -> Option<CueSpan> {
    let fragments = split_fragments(text);
    if fragments.is_empty() {
        return None;
    }
    Some(CueSpan {
        start,
        end: start + duration,
        text: fragments.join("\n"),
    })
}
