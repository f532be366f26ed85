//! # User Settings Store
//!
//! Settings edited through `/api/config`: the default speech model and the
//! translation API parameters. Persisted as pretty-printed JSON; a missing or
//! unreadable file falls back to defaults.
//!
//! Process configuration (ports, directories, limits) lives in [`crate::config`]
//! and is not editable at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Persisted settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub whisper_default_model: String,
    pub openai_api_key: String,
    pub openai_model: String,
    /// Empty means the public OpenAI endpoint
    pub openai_base_url: String,
    pub openai_temperature: f32,
    pub openai_max_tokens: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            whisper_default_model: "base".to_string(),
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            openai_base_url: String::new(),
            openai_temperature: 0.3,
            openai_max_tokens: 500,
        }
    }
}

impl Settings {
    pub fn has_api_key(&self) -> bool {
        !self.openai_api_key.is_empty()
    }

    /// Copy safe to return to clients: all but the last four key characters masked.
    pub fn masked(&self) -> Self {
        Self {
            openai_api_key: mask_key(&self.openai_api_key),
            ..self.clone()
        }
    }
}

/// Mask an API key, keeping the last four characters when it is long enough.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 4 {
        let visible: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - 4), visible)
    } else {
        "*".repeat(chars.len())
    }
}

/// Result of `/api/config/validate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check settings for problems that break features.
pub fn validate(settings: &Settings) -> ValidationReport {
    let mut report = ValidationReport::default();

    if settings.whisper_default_model.trim().is_empty() {
        report.errors.push("Default speech model is not set".to_string());
    }
    if !settings.openai_model.is_empty() && !settings.has_api_key() {
        report
            .warnings
            .push("Translation API key is not set, subtitle translation is unavailable".to_string());
    }
    if !(0.0..=2.0).contains(&settings.openai_temperature) {
        report
            .errors
            .push(format!("Temperature {} is outside 0.0..=2.0", settings.openai_temperature));
    }
    if settings.openai_max_tokens == 0 {
        report.errors.push("Max tokens must be greater than 0".to_string());
    }
    let base_url = settings.openai_base_url.trim();
    if !base_url.is_empty() && !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        report
            .errors
            .push(format!("Base URL '{base_url}' must start with http:// or https://"));
    }

    report.valid = report.errors.is_empty();
    report
}

/// JSON file holding [`Settings`], cached in memory.
///
/// The file is read once in [`new`](Self::new); afterwards only
/// [`update`](Self::update) touches the disk, so request handlers can call
/// [`load`](Self::load) without blocking.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = RwLock::new(read_file(&path));
        Self {
            path,
            current,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings.
    pub fn load(&self) -> Settings {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace the stored settings. An empty API key keeps the stored one.
    pub fn update(&self, mut incoming: Settings) -> Result<Settings> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        if incoming.openai_api_key.trim().is_empty() {
            incoming.openai_api_key = self.load().openai_api_key;
        }
        incoming.whisper_default_model = incoming.whisper_default_model.trim().to_string();
        incoming.openai_base_url = incoming.openai_base_url.trim().trim_end_matches('/').to_string();

        self.save(&incoming)?;
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = incoming.clone();
        info!(path = %self.path.display(), "Settings updated");
        Ok(incoming)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            warn!(error = %e, "Atomic settings replace failed");
            anyhow::Error::from(e)
        })
    }
}

/// Settings on disk; defaults when the file is missing or unreadable.
fn read_file(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read settings, using defaults");
            Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let (_dir, store) = store();
        let settings = store.load();
        assert_eq!(settings.whisper_default_model, "base");
        assert_eq!(settings.openai_max_tokens, 500);
    }

    fn store_with(contents: &str) -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, contents).unwrap();
        (dir, SettingsStore::new(path))
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let (_dir, store) = store_with("{ not json");
        assert_eq!(store.load().whisper_default_model, "base");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let (_dir, store) = store_with(r#"{"whisper_default_model": "small"}"#);
        let settings = store.load();
        assert_eq!(settings.whisper_default_model, "small");
        assert!((settings.openai_temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_update_keeps_existing_key_when_blank() {
        let (_dir, store) = store();
        store
            .update(Settings {
                openai_api_key: "sk-secret-1234".into(),
                ..Settings::default()
            })
            .unwrap();

        let updated = store
            .update(Settings {
                openai_api_key: String::new(),
                openai_model: "gpt-4o-mini".into(),
                openai_base_url: " https://llm.local/v1/ ".into(),
                ..Settings::default()
            })
            .unwrap();

        assert_eq!(updated.openai_api_key, "sk-secret-1234");
        assert_eq!(updated.openai_base_url, "https://llm.local/v1");
        assert_eq!(store.load(), updated);
        assert_eq!(SettingsStore::new(store.path()).load(), updated);
    }

    #[test]
    fn test_load_serves_cached_settings() {
        let (_dir, store) = store();
        store
            .update(Settings {
                whisper_default_model: "small".into(),
                ..Settings::default()
            })
            .unwrap();

        // reads after startup never go back to the file
        std::fs::remove_file(store.path()).unwrap();
        assert_eq!(store.load().whisper_default_model, "small");
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-secret-1234"), "**********1234");
        assert_eq!(mask_key("abcd"), "****");
        assert_eq!(mask_key(""), "");
        let settings = Settings {
            openai_api_key: "sk-abcdef".into(),
            ..Settings::default()
        };
        assert_eq!(settings.masked().openai_api_key, "*****cdef");
    }

    #[test]
    fn test_validate() {
        let ok = Settings {
            openai_api_key: "k".into(),
            ..Settings::default()
        };
        assert!(validate(&ok).valid);

        let no_key = Settings {
            openai_api_key: String::new(),
            ..Settings::default()
        };
        let report = validate(&no_key);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);

        let broken = Settings {
            whisper_default_model: " ".into(),
            openai_temperature: 3.0,
            openai_base_url: "ftp://x".into(),
            openai_api_key: "k".into(),
            ..Settings::default()
        };
        let report = validate(&broken);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3);
    }
}
