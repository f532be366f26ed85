//! # Model Lifecycle Manager
//!
//! Owns the runtime state of every model identifier that has been referenced:
//! which handles are loaded in memory, which downloads are in flight or failed,
//! and which on-disk loads are running right now.
//!
//! ## State Machine:
//! ```text
//! not_downloaded --download--> downloading --ok--> loaded
//!                                   |--err--> error
//! downloaded --get_model--> loading --ok--> loaded
//!                              |--err--> (no entry, reads as downloaded again)
//! loaded --delete--> not_downloaded
//! downloading | loading --delete--> rejected
//! ```
//! `not_downloaded` and `downloaded` are never stored. They are derived on each status
//! query from the on-disk model directory when no in-memory record exists.
//!
//! ## Locking:
//! One `std::sync::Mutex` guards all tables. It is held only while reading or
//! writing the tables, never across a fetch, a model load, or filesystem access.

use crate::models::loader::{ModelLoader, ProgressReporter};
use crate::models::error::ModelError;
use crate::models::registry;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Lifecycle phase reported for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    NotDownloaded,
    Downloading,
    Downloaded,
    Loading,
    Loaded,
    Error,
}

impl ModelPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelPhase::NotDownloaded => "not_downloaded",
            ModelPhase::Downloading => "downloading",
            ModelPhase::Downloaded => "downloaded",
            ModelPhase::Loading => "loading",
            ModelPhase::Loaded => "loaded",
            ModelPhase::Error => "error",
        }
    }
}

/// Snapshot returned by [`ModelManager::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub model_name: String,
    pub status: ModelPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub message: String,
}

/// Result of [`ModelManager::get_model`].
pub enum ModelLookup<H: ?Sized> {
    /// Loaded and ready to use
    Ready(Arc<H>),
    /// Not on disk, or currently downloading
    NotAvailable,
    /// Files were on disk but could not be loaded
    LoadFailed(String),
}

/// Result of [`ModelManager::download`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Started,
    AlreadyLoaded,
    InProgress,
}

/// Result of [`ModelManager::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NothingToDelete,
}

/// In-memory record for phases that are not derived from disk.
#[derive(Debug, Clone)]
enum Tracked {
    Downloading { progress: u8, message: String },
    Failed { message: String },
}

/// Every table is keyed by the fully-qualified name from
/// [`registry::full_name`], so a short name and its repository share one entry.
struct Tables<H: ?Sized> {
    loaded: HashMap<String, Arc<H>>,
    tracking: HashMap<String, Tracked>,
    /// Number of synchronous on-disk loads running per identifier
    local_loads: HashMap<String, usize>,
}

struct Shared<H: ?Sized> {
    models_root: PathBuf,
    loader: Arc<dyn ModelLoader<H>>,
    download_slots: Arc<Semaphore>,
    tables: Mutex<Tables<H>>,
}

impl<H: ?Sized> Shared<H> {
    fn lock(&self) -> MutexGuard<'_, Tables<H>> {
        // A panic while holding the lock cannot leave the maps half-written,
        // so a poisoned lock is still usable.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Thread-safe manager of model downloads, loads and deletions.
///
/// ## Usage:
/// Construct once at startup and share clones across request handlers. Clones
/// share the same tables.
///
/// ## Blocking:
/// - [`get_status`](Self::get_status) and [`download`](Self::download) return quickly.
/// - [`get_model`](Self::get_model) may load a model from disk on the calling thread.
/// - [`delete`](Self::delete) removes files on the calling thread.
pub struct ModelManager<H: ?Sized + Send + Sync + 'static> {
    shared: Arc<Shared<H>>,
}

impl<H: ?Sized + Send + Sync + 'static> Clone for ModelManager<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: ?Sized + Send + Sync + 'static> ModelManager<H> {
    /// Create a manager rooted at `models_root`.
    ///
    /// ## Parameters:
    /// - **models_root**: Directory holding one sub-directory per downloaded model
    /// - **loader**: Backend used to fetch and load model handles
    /// - **max_concurrent_downloads**: Background fetches allowed to run at once
    pub fn new(
        models_root: impl Into<PathBuf>,
        loader: Arc<dyn ModelLoader<H>>,
        max_concurrent_downloads: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                models_root: models_root.into(),
                loader,
                download_slots: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
                tables: Mutex::new(Tables {
                    loaded: HashMap::new(),
                    tracking: HashMap::new(),
                    local_loads: HashMap::new(),
                }),
            }),
        }
    }

    pub fn models_root(&self) -> &Path {
        &self.shared.models_root
    }

    /// Fully-qualified names of the models that currently hold a loaded handle.
    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().loaded.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current phase of `identifier`.
    ///
    /// Priority: loaded handle, active download, active on-disk load, recorded
    /// failure, then the on-disk directory. Unknown identifiers report
    /// `not_downloaded`.
    pub fn get_status(&self, identifier: &str) -> ModelStatus {
        let status = |phase, progress, message: &str| ModelStatus {
            model_name: identifier.to_string(),
            status: phase,
            progress,
            message: message.to_string(),
        };

        let key = registry::full_name(identifier);
        {
            let tables = self.shared.lock();
            if tables.loaded.contains_key(key) {
                return status(ModelPhase::Loaded, None, "Model is loaded");
            }
            match tables.tracking.get(key) {
                Some(Tracked::Downloading { progress, message }) => {
                    return status(ModelPhase::Downloading, Some(*progress), message);
                }
                Some(Tracked::Failed { message }) if !tables.local_loads.contains_key(key) => {
                    return status(ModelPhase::Error, Some(0), message);
                }
                _ => {}
            }
            if tables.local_loads.contains_key(key) {
                return status(ModelPhase::Loading, None, "Loading model from disk");
            }
        }

        if self.is_on_disk(identifier) {
            status(ModelPhase::Downloaded, None, "Model is downloaded")
        } else {
            status(ModelPhase::NotDownloaded, None, "Model is not downloaded")
        }
    }

    /// Return the loaded handle, loading it from disk first if needed.
    ///
    /// ## Behavior:
    /// - Loaded: returns the shared handle immediately
    /// - Downloading: returns `NotAvailable` without looking at the partial files
    /// - On disk: loads synchronously (can take seconds), publishes and returns it
    /// - Load failure: logged and returned as `LoadFailed`; no state is recorded,
    ///   so the caller has to go through status/download to recover
    pub fn get_model(&self, identifier: &str) -> ModelLookup<H> {
        let key = registry::full_name(identifier);
        let load_guard = {
            let mut tables = self.shared.lock();
            if let Some(handle) = tables.loaded.get(key) {
                return ModelLookup::Ready(Arc::clone(handle));
            }
            if let Some(Tracked::Downloading { .. }) = tables.tracking.get(key) {
                debug!(model = %identifier, "Model requested while downloading");
                return ModelLookup::NotAvailable;
            }
            *tables.local_loads.entry(key.to_string()).or_insert(0) += 1;
            LocalLoadGuard {
                shared: &self.shared,
                model: key.to_string(),
                released: false,
            }
        };

        if !self.is_on_disk(key) {
            return ModelLookup::NotAvailable;
        }

        info!(model = %identifier, repo = %key, "Model downloaded but not loaded, loading from disk");
        let started = std::time::Instant::now();

        match self.shared.loader.load_local(key, &self.shared.models_root) {
            Ok(handle) => {
                let mut tables = self.shared.lock();
                load_guard.release(&mut tables);
                if let Some(Tracked::Failed { .. }) = tables.tracking.get(key) {
                    tables.tracking.remove(key);
                }
                let handle = Arc::clone(tables.loaded.entry(key.to_string()).or_insert(handle));
                info!(
                    model = %identifier,
                    load_secs = started.elapsed().as_secs_f64(),
                    "Model loaded from disk"
                );
                ModelLookup::Ready(handle)
            }
            Err(e) => {
                error!(model = %identifier, error = %format!("{e:#}"), "Failed to load model from disk");
                ModelLookup::LoadFailed(format!("{e:#}"))
            }
        }
    }

    /// Start fetching and loading `identifier` in the background.
    ///
    /// Returns immediately. A second call while a fetch is in flight is a no-op,
    /// so at most one fetch per identifier ever runs. Must be called from within
    /// a Tokio runtime.
    pub fn download(&self, identifier: &str, revision: Option<String>) -> DownloadOutcome {
        let key = registry::full_name(identifier);
        {
            let mut tables = self.shared.lock();
            if tables.loaded.contains_key(key) {
                return DownloadOutcome::AlreadyLoaded;
            }
            let downloading = matches!(
                tables.tracking.get(key),
                Some(Tracked::Downloading { .. })
            );
            if downloading || tables.local_loads.contains_key(key) {
                return DownloadOutcome::InProgress;
            }
            tables.tracking.insert(
                key.to_string(),
                Tracked::Downloading {
                    progress: 0,
                    message: "Download queued".to_string(),
                },
            );
        }

        info!(model = %identifier, repo = %key, revision = ?revision, "Scheduling model download");

        let guard = DownloadGuard {
            shared: Arc::clone(&self.shared),
            model: key.to_string(),
            settled: false,
        };
        tokio::spawn(run_download(guard, revision));

        DownloadOutcome::Started
    }

    /// Release the handle and remove the files of `identifier`.
    ///
    /// Refused while a download or an on-disk load is running. Deleting something
    /// that does not exist succeeds with `NothingToDelete`.
    pub fn delete(&self, identifier: &str) -> Result<DeleteOutcome, ModelError> {
        let key = registry::full_name(identifier);
        let released = {
            let mut tables = self.shared.lock();
            if let Some(Tracked::Downloading { .. }) = tables.tracking.get(key) {
                warn!(model = %identifier, "Refusing to delete a model that is downloading");
                return Err(ModelError::Busy {
                    model: identifier.to_string(),
                    phase: ModelPhase::Downloading.as_str(),
                });
            }
            if tables.local_loads.contains_key(key) {
                warn!(model = %identifier, "Refusing to delete a model that is loading");
                return Err(ModelError::Busy {
                    model: identifier.to_string(),
                    phase: ModelPhase::Loading.as_str(),
                });
            }
            tables.tracking.remove(key);
            tables.loaded.remove(key).is_some()
        };

        if released {
            info!(model = %identifier, "Released model from memory");
        }

        let dir = registry::model_dir(&self.shared.models_root, key);
        if !dir.exists() {
            info!(model = %identifier, path = %dir.display(), "Model files not present");
            return Ok(if released {
                DeleteOutcome::Deleted
            } else {
                DeleteOutcome::NothingToDelete
            });
        }

        std::fs::remove_dir_all(&dir).map_err(|source| {
            error!(model = %identifier, error = %source, "Failed to delete model files");
            ModelError::DeleteFailed {
                model: identifier.to_string(),
                source,
            }
        })?;
        info!(model = %identifier, path = %dir.display(), "Deleted model files");
        Ok(DeleteOutcome::Deleted)
    }

    fn is_on_disk(&self, identifier: &str) -> bool {
        registry::model_dir(&self.shared.models_root, identifier).is_dir()
    }
}

/// Background body of a download: wait for a slot, fetch off the async
/// workers, then publish the terminal state through the guard.
async fn run_download<H: ?Sized + Send + Sync + 'static>(
    mut guard: DownloadGuard<H>,
    revision: Option<String>,
) {
    let shared = Arc::clone(&guard.shared);
    let model = guard.model.clone();

    let _permit = match Arc::clone(&shared.download_slots).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            guard.settle(Err("download pool is closed".to_string()));
            return;
        }
    };

    let reporter = progress_reporter(&shared, &model);
    reporter.report(0, "Starting download");

    let full_name = model.clone();
    let started = std::time::Instant::now();
    info!(model = %model, "Downloading model");

    let fetch = {
        let shared = Arc::clone(&shared);
        tokio::task::spawn_blocking(move || {
            shared
                .loader
                .fetch(&full_name, revision.as_deref(), &shared.models_root, &reporter)
        })
    };

    match fetch.await {
        Ok(Ok(handle)) => {
            info!(
                model = %model,
                elapsed_secs = started.elapsed().as_secs_f64(),
                "Model downloaded and loaded"
            );
            guard.settle(Ok(handle));
        }
        Ok(Err(e)) => {
            error!(model = %model, error = %format!("{e:#}"), "Model download failed");
            guard.settle(Err(format!("Download failed: {e:#}")));
        }
        Err(join_error) => {
            error!(model = %model, error = %join_error, "Model download task aborted");
            guard.settle(Err(format!("Download task aborted: {join_error}")));
        }
    }
}

/// Progress sink that only touches an entry still in the downloading phase.
fn progress_reporter<H: ?Sized + Send + Sync + 'static>(
    shared: &Arc<Shared<H>>,
    model: &str,
) -> ProgressReporter {
    let weak = Arc::downgrade(shared);
    let model = model.to_string();
    ProgressReporter::new(move |progress, message| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut tables = shared.lock();
        if let Some(Tracked::Downloading {
            progress: current,
            message: current_message,
        }) = tables.tracking.get_mut(&model)
        {
            *current = progress.min(100);
            *current_message = message.to_string();
        }
    })
}

/// Publishes the terminal state of a download exactly once.
///
/// If the task panics or is dropped before settling, `Drop` records the
/// failure so the entry never stays `downloading` forever.
struct DownloadGuard<H: ?Sized + Send + Sync + 'static> {
    shared: Arc<Shared<H>>,
    model: String,
    settled: bool,
}

impl<H: ?Sized + Send + Sync + 'static> DownloadGuard<H> {
    fn settle(&mut self, outcome: Result<Arc<H>, String>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let mut tables = self.shared.lock();
        match outcome {
            Ok(handle) => {
                tables.tracking.remove(&self.model);
                tables.loaded.insert(self.model.clone(), handle);
            }
            Err(message) => {
                tables.loaded.remove(&self.model);
                tables
                    .tracking
                    .insert(self.model.clone(), Tracked::Failed { message });
            }
        }
    }
}

impl<H: ?Sized + Send + Sync + 'static> Drop for DownloadGuard<H> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(model = %self.model, "Download ended without a result");
            self.settle(Err("Download interrupted before completion".to_string()));
        }
    }
}

/// Marks an identifier as `loading` for the duration of an on-disk load.
struct LocalLoadGuard<'a, H: ?Sized> {
    shared: &'a Shared<H>,
    model: String,
    released: bool,
}

impl<H: ?Sized> LocalLoadGuard<'_, H> {
    /// Decrement under a lock the caller already holds.
    fn release(mut self, tables: &mut Tables<H>) {
        decrement_local_load(tables, &self.model);
        self.released = true;
    }
}

impl<H: ?Sized> Drop for LocalLoadGuard<'_, H> {
    fn drop(&mut self) {
        if !self.released {
            let mut tables = self.shared.lock();
            decrement_local_load(&mut tables, &self.model);
        }
    }
}

fn decrement_local_load<H: ?Sized>(tables: &mut Tables<H>, model: &str) {
    if let Some(count) = tables.local_loads.get_mut(model) {
        *count -= 1;
        if *count == 0 {
            tables.local_loads.remove(model);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Condvar;
    use std::time::Duration;

    #[derive(Debug)]
    struct FakeModel {
        repo: String,
    }

    /// Blocks loader calls until opened.
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cvar: Condvar,
    }

    impl Gate {
        fn closed() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cvar.notify_all();
        }

        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cvar.wait(open).unwrap();
            }
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        fetches: AtomicUsize,
        local_loads: AtomicUsize,
        fetched_repos: Mutex<Vec<String>>,
        local_repos: Mutex<Vec<String>>,
        gate: Option<Arc<Gate>>,
        fail_fetch: bool,
        panic_fetch: bool,
        fail_local: bool,
    }

    impl ModelLoader<FakeModel> for FakeLoader {
        fn fetch(
            &self,
            repo_id: &str,
            _revision: Option<&str>,
            models_root: &Path,
            progress: &ProgressReporter,
        ) -> anyhow::Result<Arc<FakeModel>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.fetched_repos.lock().unwrap().push(repo_id.to_string());
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            if self.panic_fetch {
                panic!("fetch exploded");
            }
            if self.fail_fetch {
                anyhow::bail!("connection reset by peer");
            }
            progress.report(100, "done");
            std::fs::create_dir_all(registry::model_dir(models_root, repo_id))?;
            Ok(Arc::new(FakeModel {
                repo: repo_id.to_string(),
            }))
        }

        fn load_local(&self, repo_id: &str, _models_root: &Path) -> anyhow::Result<Arc<FakeModel>> {
            self.local_loads.fetch_add(1, Ordering::SeqCst);
            self.local_repos.lock().unwrap().push(repo_id.to_string());
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            if self.fail_local {
                anyhow::bail!("corrupt weights");
            }
            Ok(Arc::new(FakeModel {
                repo: repo_id.to_string(),
            }))
        }
    }

    fn manager(root: &Path, loader: Arc<FakeLoader>) -> ModelManager<FakeModel> {
        ModelManager::new(root, loader, 2)
    }

    async fn wait_for_phase(manager: &ModelManager<FakeModel>, model: &str, phase: ModelPhase) -> ModelStatus {
        for _ in 0..500 {
            let status = manager.get_status(model);
            if status.status == phase {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{model} never reached {phase:?}, last: {:?}", manager.get_status(model));
    }

    fn make_model_dir(root: &Path, model: &str) -> PathBuf {
        let dir = registry::model_dir(root, model);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_unknown_model_is_not_downloaded() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), Arc::new(FakeLoader::default()));

        let status = manager.get_status("never-heard-of-it");
        assert_eq!(status.status, ModelPhase::NotDownloaded);
        assert_eq!(status.progress, None);
        assert!(matches!(manager.get_model("never-heard-of-it"), ModelLookup::NotAvailable));
    }

    #[test]
    fn test_directory_on_disk_reports_downloaded() {
        let root = tempfile::tempdir().unwrap();
        make_model_dir(root.path(), "base");
        let manager = manager(root.path(), Arc::new(FakeLoader::default()));

        assert_eq!(manager.get_status("base").status, ModelPhase::Downloaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_success_transitions_to_loaded() {
        let root = tempfile::tempdir().unwrap();
        let gate = Gate::closed();
        let loader = Arc::new(FakeLoader {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let manager = manager(root.path(), Arc::clone(&loader));

        assert_eq!(manager.get_status("tiny").status, ModelPhase::NotDownloaded);
        assert_eq!(manager.download("tiny", None), DownloadOutcome::Started);

        let status = manager.get_status("tiny");
        assert_eq!(status.status, ModelPhase::Downloading);
        assert_eq!(status.progress, Some(0));
        assert!(matches!(manager.get_model("tiny"), ModelLookup::NotAvailable));

        gate.open();
        wait_for_phase(&manager, "tiny", ModelPhase::Loaded).await;

        match manager.get_model("tiny") {
            ModelLookup::Ready(model) => assert_eq!(model.repo, "openai/whisper-tiny"),
            _ => panic!("expected a loaded model"),
        }
        assert_eq!(manager.loaded_models(), vec!["openai/whisper-tiny".to_string()]);
        assert_eq!(loader.local_loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_download_requests_fetch_once() {
        let root = tempfile::tempdir().unwrap();
        let gate = Gate::closed();
        let loader = Arc::new(FakeLoader {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let manager = manager(root.path(), Arc::clone(&loader));

        assert_eq!(manager.download("small", None), DownloadOutcome::Started);
        assert_eq!(manager.download("small", None), DownloadOutcome::InProgress);
        assert_eq!(manager.download("small", Some("main".into())), DownloadOutcome::InProgress);

        gate.open();
        wait_for_phase(&manager, "small", ModelPhase::Loaded).await;

        assert_eq!(loader.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.download("small", None), DownloadOutcome::AlreadyLoaded);
        assert_eq!(loader.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_failure_records_error() {
        let root = tempfile::tempdir().unwrap();
        let loader = Arc::new(FakeLoader {
            fail_fetch: true,
            ..Default::default()
        });
        let manager = manager(root.path(), Arc::clone(&loader));

        manager.download("medium", None);
        let status = wait_for_phase(&manager, "medium", ModelPhase::Error).await;

        assert!(status.message.contains("connection reset by peer"));
        assert_eq!(status.progress, Some(0));
        assert!(manager.loaded_models().is_empty());

        // errors are retryable
        assert_eq!(manager.download("medium", None), DownloadOutcome::Started);
        wait_for_phase(&manager, "medium", ModelPhase::Error).await;
        assert_eq!(loader.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_fetch_still_reaches_error() {
        let root = tempfile::tempdir().unwrap();
        let loader = Arc::new(FakeLoader {
            panic_fetch: true,
            ..Default::default()
        });
        let manager = manager(root.path(), loader);

        manager.download("base", None);
        let status = wait_for_phase(&manager, "base", ModelPhase::Error).await;
        assert!(status.message.contains("aborted"));
        assert!(manager.loaded_models().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_refused_while_downloading() {
        let root = tempfile::tempdir().unwrap();
        let gate = Gate::closed();
        let loader = Arc::new(FakeLoader {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let manager = manager(root.path(), loader);
        let dir = make_model_dir(root.path(), "base");

        manager.download("base", None);
        let result = manager.delete("base");

        assert!(matches!(result, Err(ModelError::Busy { phase: "downloading", .. })));
        assert_eq!(manager.get_status("base").status, ModelPhase::Downloading);
        assert!(dir.exists());

        gate.open();
        wait_for_phase(&manager, "base", ModelPhase::Loaded).await;
    }

    #[test]
    fn test_delete_with_nothing_present_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), Arc::new(FakeLoader::default()));

        assert_eq!(manager.delete("tiny").unwrap(), DeleteOutcome::NothingToDelete);
        assert_eq!(manager.delete("tiny").unwrap(), DeleteOutcome::NothingToDelete);
    }

    #[test]
    fn test_delete_releases_handle_then_removes_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = make_model_dir(root.path(), "tiny");
        let manager = manager(root.path(), Arc::new(FakeLoader::default()));

        let handle = match manager.get_model("tiny") {
            ModelLookup::Ready(handle) => handle,
            _ => panic!("expected lazy load"),
        };

        assert_eq!(manager.delete("tiny").unwrap(), DeleteOutcome::Deleted);
        assert!(!dir.exists());
        assert_eq!(manager.get_status("tiny").status, ModelPhase::NotDownloaded);
        assert!(manager.loaded_models().is_empty());
        // lent handles outlive the delete
        assert_eq!(handle.repo, "openai/whisper-tiny");
    }

    #[test]
    fn test_loaded_handle_wins_over_disk() {
        let root = tempfile::tempdir().unwrap();
        make_model_dir(root.path(), "small");
        let manager = manager(root.path(), Arc::new(FakeLoader::default()));

        assert!(matches!(manager.get_model("small"), ModelLookup::Ready(_)));
        assert!(registry::model_dir(root.path(), "small").exists());
        assert_eq!(manager.get_status("small").status, ModelPhase::Loaded);
    }

    #[test]
    fn test_lazy_load_from_disk_is_cached() {
        let root = tempfile::tempdir().unwrap();
        make_model_dir(root.path(), "base");
        let loader = Arc::new(FakeLoader::default());
        let manager = manager(root.path(), Arc::clone(&loader));

        let first = match manager.get_model("base") {
            ModelLookup::Ready(handle) => handle,
            _ => panic!("expected lazy load"),
        };
        let second = match manager.get_model("base") {
            ModelLookup::Ready(handle) => handle,
            _ => panic!("expected cached handle"),
        };

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.local_loads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_status("base").status, ModelPhase::Loaded);
    }

    #[test]
    fn test_failed_local_load_leaves_no_entry() {
        let root = tempfile::tempdir().unwrap();
        make_model_dir(root.path(), "medium");
        let loader = Arc::new(FakeLoader {
            fail_local: true,
            ..Default::default()
        });
        let manager = manager(root.path(), loader);

        match manager.get_model("medium") {
            ModelLookup::LoadFailed(reason) => assert!(reason.contains("corrupt weights")),
            _ => panic!("expected load failure"),
        }
        assert_eq!(manager.get_status("medium").status, ModelPhase::Downloaded);
        assert!(manager.loaded_models().is_empty());
        assert_eq!(manager.delete("medium").unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_refused_while_loading_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let dir = make_model_dir(root.path(), "tiny");
        let gate = Gate::closed();
        let loader = Arc::new(FakeLoader {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let manager = manager(root.path(), Arc::clone(&loader));

        let background = manager.clone();
        let load = tokio::task::spawn_blocking(move || {
            matches!(background.get_model("tiny"), ModelLookup::Ready(_))
        });

        wait_for_phase(&manager, "tiny", ModelPhase::Loading).await;
        assert!(matches!(
            manager.delete("tiny"),
            Err(ModelError::Busy { phase: "loading", .. })
        ));
        assert_eq!(manager.download("tiny", None), DownloadOutcome::InProgress);
        assert!(dir.exists());

        gate.open();
        assert!(load.await.unwrap());
        assert_eq!(manager.get_status("tiny").status, ModelPhase::Loaded);
        assert_eq!(loader.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_short_name_maps_consistently() {
        let root = tempfile::tempdir().unwrap();
        let loader = Arc::new(FakeLoader::default());
        let manager = manager(root.path(), Arc::clone(&loader));

        manager.download("small", None);
        wait_for_phase(&manager, "small", ModelPhase::Loaded).await;

        let expected_dir = registry::model_dir(root.path(), "openai/whisper-small");
        assert_eq!(loader.fetched_repos.lock().unwrap().as_slice(), ["openai/whisper-small"]);
        assert!(expected_dir.is_dir());

        assert_eq!(manager.delete("small").unwrap(), DeleteOutcome::Deleted);
        assert!(!expected_dir.exists());

        // the short name and the full name see the same directory
        make_model_dir(root.path(), "openai/whisper-small");
        assert_eq!(manager.get_status("small").status, ModelPhase::Downloaded);
        assert!(matches!(manager.get_model("small"), ModelLookup::Ready(_)));
        assert_eq!(loader.local_repos.lock().unwrap().as_slice(), ["openai/whisper-small"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_name_alias_shares_the_download() {
        let root = tempfile::tempdir().unwrap();
        let dir = make_model_dir(root.path(), "small");
        let gate = Gate::closed();
        let loader = Arc::new(FakeLoader {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let manager = manager(root.path(), Arc::clone(&loader));

        assert_eq!(manager.download("small", None), DownloadOutcome::Started);
        assert_eq!(
            manager.download("openai/whisper-small", None),
            DownloadOutcome::InProgress
        );

        let status = manager.get_status("openai/whisper-small");
        assert_eq!(status.status, ModelPhase::Downloading);
        assert_eq!(status.model_name, "openai/whisper-small");
        assert!(matches!(
            manager.delete("openai/whisper-small"),
            Err(ModelError::Busy { phase: "downloading", .. })
        ));
        assert!(dir.exists());

        gate.open();
        wait_for_phase(&manager, "small", ModelPhase::Loaded).await;

        assert_eq!(loader.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_status("openai/whisper-small").status, ModelPhase::Loaded);
        assert_eq!(
            manager.download("openai/whisper-small", None),
            DownloadOutcome::AlreadyLoaded
        );
        assert_eq!(manager.loaded_models(), vec!["openai/whisper-small".to_string()]);

        assert_eq!(manager.delete("openai/whisper-small").unwrap(), DeleteOutcome::Deleted);
        assert_eq!(manager.get_status("small").status, ModelPhase::NotDownloaded);
        assert!(manager.loaded_models().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_name_alias_sees_load_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let dir = make_model_dir(root.path(), "openai/whisper-tiny");
        let gate = Gate::closed();
        let loader = Arc::new(FakeLoader {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let manager = manager(root.path(), Arc::clone(&loader));

        let background = manager.clone();
        let load = tokio::task::spawn_blocking(move || match background.get_model("tiny") {
            ModelLookup::Ready(handle) => Some(handle),
            _ => None,
        });

        wait_for_phase(&manager, "openai/whisper-tiny", ModelPhase::Loading).await;
        assert!(matches!(
            manager.delete("openai/whisper-tiny"),
            Err(ModelError::Busy { phase: "loading", .. })
        ));
        assert_eq!(
            manager.download("openai/whisper-tiny", None),
            DownloadOutcome::InProgress
        );
        assert!(dir.exists());

        gate.open();
        let first = load.await.unwrap().expect("load from disk");
        match manager.get_model("openai/whisper-tiny") {
            ModelLookup::Ready(second) => assert!(Arc::ptr_eq(&first, &second)),
            _ => panic!("expected the handle loaded under the short name"),
        }
        assert_eq!(loader.local_loads.load(Ordering::SeqCst), 1);
        assert_eq!(loader.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_status_serialization() {
        let status = ModelStatus {
            model_name: "tiny".to_string(),
            status: ModelPhase::Downloading,
            progress: Some(42),
            message: "Downloading".to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["progress"], 42);

        let loaded = ModelStatus { progress: None, status: ModelPhase::Loaded, ..status };
        let json = serde_json::to_value(&loaded).unwrap();
        assert!(json.get("progress").is_none());
    }
}
