//! # Model Registry
//!
//! Static description of the Whisper models this service knows about, plus the
//! name-mapping table that turns short identifiers into the fully-qualified hub
//! repositories used for fetching and on-disk layout.
//!
//! ## Key Rules:
//! - **Descriptors are presentation only**: the lifecycle manager never consults them
//!   when deciding what state a model is in.
//! - **One mapping everywhere**: existence checks, remote fetch, deletion and the
//!   lifecycle manager's tracking keys all go through [`full_name`], so `small`
//!   and `openai/whisper-small` are the same model.

use crate::models::error::ModelError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix of hub cache directories for model repositories.
const MODEL_DIR_PREFIX: &str = "models--";

/// Separator replacing `/` in hub cache directory names.
const MODEL_DIR_SEPARATOR: &str = "--";

/// Short identifier → fully-qualified hub repository.
///
/// The targets are safetensors repositories, which is the weight format the
/// candle Whisper engine can load.
const NAME_MAPPING: &[(&str, &str)] = &[
    ("tiny", "openai/whisper-tiny"),
    ("base", "openai/whisper-base"),
    ("small", "openai/whisper-small"),
    ("medium", "openai/whisper-medium"),
    ("large-v1", "openai/whisper-large"),
    ("large-v2", "openai/whisper-large-v2"),
    ("large-v3", "openai/whisper-large-v3"),
];

/// Static metadata about one model, shown to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub size_mb: u32,
    pub speed: &'static str,
    pub accuracy: &'static str,
}

/// (identifier, display name, description, size in MB, speed tier, accuracy tier)
type DescriptorRow = (&'static str, &'static str, &'static str, u32, &'static str, &'static str);

const DESCRIPTORS: &[DescriptorRow] = &[
    ("tiny", "Tiny", "Fastest, lowest accuracy (~39 MB)", 39, "fastest", "low"),
    ("base", "Base", "Balanced speed and accuracy (~74 MB)", 74, "fast", "medium"),
    ("small", "Small", "Good accuracy (~244 MB)", 244, "moderate", "good"),
    ("medium", "Medium", "High accuracy (~769 MB)", 769, "slow", "high"),
    ("large-v1", "Large v1", "Highest accuracy (~1550 MB)", 1550, "slowest", "highest"),
    ("large-v2", "Large v2", "Improved large model (~1550 MB)", 1550, "slowest", "highest"),
    ("large-v3", "Large v3", "Latest large model (~1550 MB)", 1550, "slowest", "highest"),
    ("openai/whisper-tiny", "OpenAI Tiny", "Official OpenAI tiny checkpoint (~39 MB)", 39, "fastest", "low"),
    ("openai/whisper-base", "OpenAI Base", "Official OpenAI base checkpoint (~74 MB)", 74, "fast", "medium"),
    ("openai/whisper-small", "OpenAI Small", "Official OpenAI small checkpoint (~244 MB)", 244, "moderate", "good"),
    ("openai/whisper-medium", "OpenAI Medium", "Official OpenAI medium checkpoint (~769 MB)", 769, "slow", "high"),
    ("openai/whisper-large-v3", "OpenAI Large v3", "Official OpenAI large-v3 checkpoint (~1550 MB)", 1550, "slowest", "highest"),
];

/// Every known model keyed by identifier.
pub fn describe_all() -> BTreeMap<&'static str, ModelDescriptor> {
    DESCRIPTORS
        .iter()
        .map(|&(id, name, description, size_mb, speed, accuracy)| {
            (
                id,
                ModelDescriptor {
                    name,
                    description,
                    size_mb,
                    speed,
                    accuracy,
                },
            )
        })
        .collect()
}

/// Whether the identifier appears in the descriptor table.
pub fn is_known(identifier: &str) -> bool {
    DESCRIPTORS.iter().any(|(id, ..)| *id == identifier)
}

/// Map a short identifier to its hub repository; anything else passes through.
pub fn full_name(identifier: &str) -> &str {
    NAME_MAPPING
        .iter()
        .find(|(short, _)| *short == identifier)
        .map(|(_, full)| *full)
        .unwrap_or(identifier)
}

/// Directory holding a model's files under `models_root`.
///
/// Mirrors the hub cache naming: `openai/whisper-small` lives in
/// `models--openai--whisper-small`.
pub fn model_dir(models_root: &Path, identifier: &str) -> PathBuf {
    let full = full_name(identifier);
    models_root.join(format!(
        "{}{}",
        MODEL_DIR_PREFIX,
        full.replace('/', MODEL_DIR_SEPARATOR)
    ))
}

/// Accept registry identifiers and fully-qualified `owner/name` repositories.
pub fn resolve(identifier: &str) -> Result<&str, ModelError> {
    let identifier = identifier.trim();
    if is_known(identifier) || is_fully_qualified(identifier) {
        Ok(identifier)
    } else {
        Err(ModelError::UnknownModel(identifier.to_string()))
    }
}

fn is_fully_qualified(identifier: &str) -> bool {
    let mut parts = identifier.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => {
            let valid = |s: &str| {
                !s.is_empty()
                    && s != "."
                    && s != ".."
                    && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
            };
            valid(owner) && valid(name)
        }
        _ => false,
    }
}
