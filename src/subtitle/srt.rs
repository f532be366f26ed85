//! SRT format: numbered blocks of a timing line and one or more text lines,
//! separated by blank lines.
//!
//! ```text
//! 1
//! 00:00:01,000 --> 00:00:03,500
//! Hello there
//! ```

use crate::subtitle::SubtitleError;
use crate::transcription::Segment;

/// One subtitle block. Times are milliseconds from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleEntry {
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Seconds to `HH:MM:SS,mmm`. Negative and non-finite inputs clamp to zero.
pub fn format_timestamp(seconds: f64) -> String {
    let ms = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    };
    format_ms(ms)
}

fn format_ms(ms: u64) -> String {
    format!(
        "{:02}:{:02}:{:02},{:03}",
        ms / 3_600_000,
        (ms % 3_600_000) / 60_000,
        (ms % 60_000) / 1000,
        ms % 1000
    )
}

/// `HH:MM:SS,mmm` (or with `.`) to milliseconds.
pub fn parse_timestamp(value: &str) -> Result<u64, SubtitleError> {
    let invalid = || SubtitleError::InvalidTimestamp(value.to_string());
    let value = value.trim();

    let (clock, millis) = value
        .split_once(',')
        .or_else(|| value.split_once('.'))
        .ok_or_else(invalid)?;
    let mut parts = clock.split(':');
    let (Some(h), Some(m), Some(s), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    let number = |s: &str| s.trim().parse::<u64>().map_err(|_| invalid());
    let (h, m, s) = (number(h)?, number(m)?, number(s)?);
    if m >= 60 || s >= 60 || millis.is_empty() || millis.len() > 3 {
        return Err(invalid());
    }
    // ",5" means 500 ms
    let ms = number(millis)? * 10u64.pow(3 - millis.len() as u32);

    Ok(((h * 60 + m) * 60 + s) * 1000 + ms)
}

/// Parse SRT text. Accepts CRLF line endings and a leading BOM; a missing or
/// non-numeric index line is tolerated and renumbered.
pub fn parse(content: &str) -> Result<Vec<SubtitleEntry>, SubtitleError> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n").replace('\r', "\n");

    let mut entries = Vec::new();
    for (block_no, block) in content
        .split("\n\n")
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .enumerate()
    {
        let block_no = block_no + 1;
        let mut lines = block.lines().peekable();

        if lines.peek().is_some_and(|l| !l.contains("-->")) {
            lines.next();
        }
        let timing = lines.next().ok_or_else(|| SubtitleError::MalformedBlock {
            block: block_no,
            reason: "missing timing line".to_string(),
        })?;
        let (start, end) = timing
            .split_once("-->")
            .ok_or_else(|| SubtitleError::MalformedBlock {
                block: block_no,
                reason: format!("expected 'start --> end', got '{timing}'"),
            })?;
        // positional hints such as "X1:..." may follow the end time
        let end = end.split_whitespace().next().unwrap_or_default();

        let text = lines.collect::<Vec<_>>().join("\n");
        entries.push(SubtitleEntry {
            index: entries.len() + 1,
            start_ms: parse_timestamp(start)?,
            end_ms: parse_timestamp(end)?,
            text,
        });
    }

    if entries.is_empty() {
        return Err(SubtitleError::Empty);
    }
    Ok(entries)
}

/// Render entries as SRT, renumbering from 1.
pub fn serialize(entries: &[SubtitleEntry]) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n",
            i + 1,
            format_ms(entry.start_ms),
            format_ms(entry.end_ms),
            entry.text.trim()
        ));
    }
    out
}

/// Render transcription segments as SRT.
pub fn segments_to_srt(segments: &[Segment]) -> String {
    let entries: Vec<SubtitleEntry> = segments
        .iter()
        .enumerate()
        .map(|(i, segment)| SubtitleEntry {
            index: i + 1,
            start_ms: (segment.start.max(0.0) * 1000.0).round() as u64,
            end_ms: (segment.end.max(0.0) * 1000.0).round() as u64,
            text: segment.text.trim().to_string(),
        })
        .collect();
    serialize(&entries)
}
