//! # Subtitle Module
//!
//! SRT reading and writing, shared by transcription output and subtitle
//! translation.

pub mod srt;

pub use srt::{parse, segments_to_srt, serialize, SubtitleEntry};

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SubtitleError {
    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("Malformed subtitle block {block}: {reason}")]
    MalformedBlock { block: usize, reason: String },

    #[error("Subtitle file contains no entries")]
    Empty,
}
