//! # Application State Management
//!
//! Shared state handed to every request handler through `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every worker thread share ownership of the same data
//! - **Clone is cheap**: Cloning an `Arc` only bumps a counter
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Used for**: request metrics, which every request updates
//!
//! ## What lives here:
//! - **config**: process configuration, read-only after startup
//! - **models**: the model lifecycle manager (it does its own locking)
//! - **settings**: the JSON settings store (it does its own locking)
//! - **metrics**: request counters updated by middleware

use crate::config::AppConfig;
use crate::models::ModelManager;
use crate::settings::SettingsStore;
use crate::transcription::Transcriber;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Speech model lifecycle. Clones share the same tables.
    pub models: ModelManager<dyn Transcriber>,

    pub settings: Arc<SettingsStore>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Human-readable description of the compute device models run on
    pub device: String,

    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Transcriptions, translations and separations currently running
    pub active_jobs: u32,

    /// Key: endpoint name (e.g., "GET /api/health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        models: ModelManager<dyn Transcriber>,
        settings: SettingsStore,
        device: impl Into<String>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            models,
            settings: Arc::new(settings),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            device: device.into(),
            start_time: Instant::now(),
        }
    }

    // Metrics stay meaningful after a panicking writer, so poisoning is ignored.
    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|p| p.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    /// Called for every 4xx/5xx response.
    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /api/health")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Count a long-running job until the returned guard is dropped.
    pub fn begin_job(&self) -> JobGuard {
        self.metrics_write().active_jobs += 1;
        JobGuard {
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Snapshot so the lock is not held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Decrements `active_jobs` on drop, including when the job fails or panics.
pub struct JobGuard {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(|p| p.into_inner());
        metrics.active_jobs = metrics.active_jobs.saturating_sub(1);
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders shared by handler tests.

    use super::*;
    use crate::models::loader::ProgressReporter;
    use crate::models::ModelLoader;
    use crate::transcription::{Segment, TranscribeOptions, Transcript};
    use anyhow::{anyhow, Result};
    use std::path::Path;

    /// Transcriber that returns fixed segments.
    pub struct FakeTranscriber;

    impl Transcriber for FakeTranscriber {
        fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript> {
            let duration = samples.len() as f64 / crate::transcription::SAMPLE_RATE as f64;
            let segments = vec![
                Segment { id: 0, start: 0.0, end: 1.0, text: " Hello".into() },
                Segment { id: 1, start: 1.0, end: 2.5, text: " world.".into() },
            ];
            let language = options.language.clone().unwrap_or_else(|| "en".into());
            Ok(Transcript::from_segments(segments, language, duration))
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    /// Loader that loads any directory present on disk and never downloads.
    pub struct DiskOnlyLoader;

    impl ModelLoader<dyn Transcriber> for DiskOnlyLoader {
        fn fetch(
            &self,
            repo_id: &str,
            _revision: Option<&str>,
            _models_root: &Path,
            _progress: &ProgressReporter,
        ) -> Result<Arc<dyn Transcriber>> {
            Err(anyhow!("offline, cannot fetch {repo_id}"))
        }

        fn load_local(&self, _repo_id: &str, _models_root: &Path) -> Result<Arc<dyn Transcriber>> {
            Ok(Arc::new(FakeTranscriber))
        }
    }

    /// State rooted in `dir` with the fake loader.
    pub fn state_in(dir: &Path) -> AppState {
        let mut config = AppConfig::default();
        config.storage.models_dir = dir.join("models");
        config.storage.uploads_dir = dir.join("uploads");
        config.storage.settings_file = dir.join("settings.json");

        let models = ModelManager::new(
            config.storage.models_dir.clone(),
            Arc::new(DiskOnlyLoader) as Arc<dyn ModelLoader<dyn Transcriber>>,
            1,
        );
        let settings = SettingsStore::new(config.storage.settings_file.clone());
        AppState::new(config, models, settings, "CPU")
    }
}
