//! SRT (SubRip) cue model and text rendering.

use std::time::Duration;

/// A single subtitle cue. The formatted block returned by [`format_cue`]
/// is the cue's external representation; concatenating the blocks of one
/// run in emission order yields the full subtitle document.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub index: u32,
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

fn ms_to_srt_time(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let mins = (ms % 3_600_000) / 60_000;
    let secs = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{:02}:{:02}:{:02},{:03}", hours, mins, secs, millis)
}

/// `HH:MM:SS,mmm` timestamp used on the cue timing line.
pub fn srt_timestamp(t: Duration) -> String {
    ms_to_srt_time(t.as_millis() as u64)
}

/// Render one cue block:
/// index line, `start --> end` timing line, text, trailing blank line.
pub fn format_cue(cue: &Cue) -> String {
    format!(
        "{}\n{} --> {}\n{}\n\n",
        cue.index,
        srt_timestamp(cue.start),
        srt_timestamp(cue.end),
        cue.text
    )
}
