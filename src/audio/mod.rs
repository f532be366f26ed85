//! # Audio Module
//!
//! Turns uploaded audio files into what the speech engine consumes: 16 kHz mono
//! `f32` samples in `[-1.0, 1.0]`.
//!
//! ## Key Components:
//! - **decode**: container probing, packet decoding, downmix and resampling
//! - **AudioInfo**: basic facts about an upload, reported by `/api/process`

pub mod decode;

pub use decode::{decode, probe};

use serde::Serialize;
use thiserror::Error;

/// Errors raised while reading uploaded audio.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("No audio track found")]
    NoAudioTrack,

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Resample error: {0}")]
    Resample(String),

    #[error("Audio contains no samples")]
    Empty,
}

/// Facts about an audio file as uploaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioInfo {
    /// Container/codec hint derived from the file name
    pub format: String,
    /// Seconds
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioInfo {
    /// Duration rendered as `HH:MM:SS`.
    pub fn duration_hms(&self) -> String {
        let total = self.duration.max(0.0).round() as u64;
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

/// Decoded mono audio at its target rate.
#[derive(Debug, Clone)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioData {
    /// Seconds of audio.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}
