//! # Transcription Module
//!
//! Speech-to-text on top of Whisper checkpoints running in candle.
//!
//! ## Key Components:
//! - **Transcriber**: the trait the HTTP layer and the model manager see
//! - **WhisperModel**: candle implementation with language detection and
//!   timestamped segments
//! - **mel**: mel filter bank used to build the model input

pub mod mel;
pub mod whisper;

pub use whisper::WhisperModel;

use serde::{Deserialize, Serialize};

/// What the decoder should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// Text in the spoken language
    #[default]
    Transcribe,
    /// English text regardless of the spoken language
    Translate,
}

/// Per-request decoding options.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    /// ISO 639-1 code; detected from the audio when `None`
    pub language: Option<String>,
    pub task: Task,
}

/// A span of recognised speech.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub id: usize,
    /// Seconds from the start of the audio
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Full result of a transcription.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    /// Audio duration in seconds
    pub duration: f64,
    pub segments: Vec<Segment>,
}

impl Transcript {
    /// Build a transcript from segments, joining their text.
    pub fn from_segments(segments: Vec<Segment>, language: String, duration: f64) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            text,
            language,
            duration,
            segments,
        }
    }
}

/// A loaded speech-to-text model.
///
/// `samples` are mono 32-bit floats at [`SAMPLE_RATE`]. Implementations
/// serialize concurrent calls internally when they need to.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> anyhow::Result<Transcript>;

    /// Short description for logs and status payloads.
    fn describe(&self) -> String;
}

/// Sample rate every transcriber expects.
pub const SAMPLE_RATE: u32 = 16_000;
