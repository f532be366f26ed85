//! # Model Loaders
//!
//! The lifecycle manager never talks to the hub or to candle directly. It goes
//! through a [`ModelLoader`], which knows how to fetch a repository into the
//! models directory and how to turn files already on disk into a usable handle.
//!
//! ## On-disk Layout:
//! Files are stored in the hub cache layout under the models directory:
//! ```text
//! models/models--openai--whisper-small/
//!   refs/main                 -> commit hash
//!   snapshots/<hash>/config.json, tokenizer.json, model.safetensors
//!   blobs/...
//! ```

use crate::transcription::{Transcriber, WhisperModel};
use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::api::Progress;
use hf_hub::{Cache, Repo, RepoType};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backend that produces model handles of type `H`.
///
/// Both methods block and are called off the async workers.
pub trait ModelLoader<H: ?Sized>: Send + Sync {
    /// Fetch `repo_id` into `models_root` and load it.
    fn fetch(
        &self,
        repo_id: &str,
        revision: Option<&str>,
        models_root: &Path,
        progress: &ProgressReporter,
    ) -> Result<Arc<H>>;

    /// Load `repo_id` from files already present under `models_root`.
    fn load_local(&self, repo_id: &str, models_root: &Path) -> Result<Arc<H>>;
}

/// Callback through which a fetch reports its percentage.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u8, &str) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u8, &str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn report(&self, progress: u8, message: &str) {
        (self.sink)(progress.min(100), message);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Files needed for a Whisper checkpoint with the share of overall progress
/// each one accounts for.
const WHISPER_FILES: &[(&str, f64)] = &[
    ("config.json", 1.0),
    ("tokenizer.json", 4.0),
    ("model.safetensors", 90.0),
];

/// Progress reported once every file is present and weights are being loaded.
const LOADING_PROGRESS: u8 = 95;

/// Loads Whisper checkpoints from the hub onto a candle device.
pub struct WhisperLoader {
    device: Device,
}

impl WhisperLoader {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl ModelLoader<dyn Transcriber> for WhisperLoader {
    fn fetch(
        &self,
        repo_id: &str,
        revision: Option<&str>,
        models_root: &Path,
        progress: &ProgressReporter,
    ) -> Result<Arc<dyn Transcriber>> {
        let snapshot = fetch_snapshot(repo_id, revision, models_root, WHISPER_FILES, progress)?;
        progress.report(LOADING_PROGRESS, "Loading model weights");
        let model = WhisperModel::load(&snapshot, self.device.clone())
            .with_context(|| format!("Failed to load {repo_id} after download"))?;
        Ok(Arc::new(model))
    }

    fn load_local(&self, repo_id: &str, models_root: &Path) -> Result<Arc<dyn Transcriber>> {
        let snapshot = local_snapshot(models_root, repo_id)?;
        let model = WhisperModel::load(&snapshot, self.device.clone())
            .with_context(|| format!("Failed to load {repo_id} from {}", snapshot.display()))?;
        Ok(Arc::new(model))
    }
}

/// Download `files` of `repo_id` into the hub cache at `models_root`.
///
/// Files already in the cache are not downloaded again. Returns the snapshot
/// directory holding all requested files.
pub fn fetch_snapshot(
    repo_id: &str,
    revision: Option<&str>,
    models_root: &Path,
    files: &[(&str, f64)],
    progress: &ProgressReporter,
) -> Result<PathBuf> {
    std::fs::create_dir_all(models_root)
        .with_context(|| format!("Failed to create models directory {}", models_root.display()))?;

    let repo = match revision {
        Some(revision) => Repo::with_revision(repo_id.to_string(), RepoType::Model, revision.to_string()),
        None => Repo::model(repo_id.to_string()),
    };

    let mut builder = ApiBuilder::new()
        .with_cache_dir(models_root.to_path_buf())
        .with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        tracing::debug!("Using HF token from environment (length: {})", token.len());
        builder = builder.with_token(Some(token));
    }
    let api = builder.build().context("Failed to build hub client")?;
    let api_repo = api.repo(repo.clone());
    let cache = Cache::new(models_root.to_path_buf()).repo(repo);

    let total_weight: f64 = files.iter().map(|(_, weight)| weight).sum();
    let scale = f64::from(LOADING_PROGRESS) / total_weight.max(f64::EPSILON);
    let mut base = 0.0;
    let mut snapshot_dir = None;

    for (file, weight) in files {
        let band = weight * scale;
        let path = match cache.get(file) {
            Some(path) => {
                tracing::debug!(repo = %repo_id, file = %file, "File already cached");
                path
            }
            None => {
                tracing::info!(repo = %repo_id, file = %file, "Downloading file");
                let file_progress = FileProgress::new(progress.clone(), base, band);
                api_repo
                    .download_with_progress(file, file_progress)
                    .map_err(|e| anyhow!("Failed to download {file} from {repo_id}: {e}"))?
            }
        };
        base += band;
        progress.report(base as u8, &format!("Downloaded {file}"));
        snapshot_dir = path.parent().map(Path::to_path_buf);
    }

    snapshot_dir.ok_or_else(|| anyhow!("No files requested for {repo_id}"))
}

/// Locate the snapshot directory of a repository that is already on disk.
///
/// Prefers the snapshot `refs/main` points at, then any snapshot holding a
/// `config.json`.
pub fn local_snapshot(models_root: &Path, repo_id: &str) -> Result<PathBuf> {
    let repo_dir = models_root.join(Repo::model(repo_id.to_string()).folder_name());
    let snapshots = repo_dir.join("snapshots");

    if let Ok(commit) = std::fs::read_to_string(repo_dir.join("refs").join("main")) {
        let candidate = snapshots.join(commit.trim());
        if candidate.join("config.json").is_file() {
            return Ok(candidate);
        }
    }

    let entries = std::fs::read_dir(&snapshots)
        .with_context(|| format!("No snapshots for {repo_id} in {}", snapshots.display()))?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.join("config.json").is_file())
        .ok_or_else(|| anyhow!("No complete snapshot for {repo_id} in {}", snapshots.display()))
}

/// Maps byte progress of one file onto its band of overall progress.
struct FileProgress {
    reporter: ProgressReporter,
    base: f64,
    band: f64,
    filename: String,
    total: usize,
    done: usize,
    last: u8,
}

impl FileProgress {
    fn new(reporter: ProgressReporter, base: f64, band: f64) -> Self {
        Self {
            reporter,
            base,
            band,
            filename: String::new(),
            total: 0,
            done: 0,
            last: base as u8,
        }
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return self.base as u8;
        }
        let fraction = (self.done as f64 / self.total as f64).min(1.0);
        (self.base + self.band * fraction) as u8
    }
}

impl Progress for FileProgress {
    fn init(&mut self, size: usize, filename: &str) {
        self.total = size;
        self.done = 0;
        self.filename = filename.to_string();
        self.reporter
            .report(self.last, &format!("Downloading {}", self.filename));
    }

    fn update(&mut self, size: usize) {
        self.done += size;
        let percent = self.percent();
        if percent > self.last {
            self.last = percent;
            self.reporter
                .report(percent, &format!("Downloading {}", self.filename));
        }
    }

    fn finish(&mut self) {
        self.done = self.total;
        self.last = self.percent();
    }
}
