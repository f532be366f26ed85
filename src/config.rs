//! # Configuration Management
//!
//! This module loads the process configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! User-editable settings (default model, translation credentials) are not part
//! of this configuration; they live in the JSON store in [`crate::settings`].
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables
//! 2. Environment variables (APP_SERVER__PORT, APP_STORAGE__MODELS_DIR, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::device::DevicePreference;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: where to listen and which browser origins may call us
/// - **storage**: directories for models, uploads and the settings file
/// - **models**: compute device for speech models
/// - **performance**: download concurrency and upload size limits
/// - **separation**: source-separation executable
/// - **logging**: rolling log file location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub models: ModelsConfig,
    pub performance: PerformanceConfig,
    pub separation: SeparationConfig,
    pub logging: LoggingConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (default, this is a local service)
/// - `cors_origins`: dev servers of the web front end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the hub-layout model directories (`models--owner--name`)
    pub models_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub settings_file: PathBuf,
}

/// Speech model runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// "auto", "cpu", "cuda" or "metal"
    pub device: String,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - More concurrent downloads finish a batch sooner but share bandwidth
/// - `max_upload_mb` bounds the memory a single multipart upload can take
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_downloads: usize,
    pub max_upload_mb: usize,
}

/// Source-separation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparationConfig {
    /// Demucs executable name or path
    pub command: String,
}

/// Log file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                cors_origins: vec![
                    "http://localhost:5173".to_string(), // Vite default port
                    "http://localhost:3000".to_string(),
                ],
            },
            storage: StorageConfig {
                models_dir: PathBuf::from("models"),
                uploads_dir: PathBuf::from("uploads"),
                settings_file: PathBuf::from("settings.json"),
            },
            models: ModelsConfig {
                device: "auto".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_downloads: 2,
                max_upload_mb: 512,
            },
            separation: SeparationConfig {
                command: "demucs".to_string(),
            },
            logging: LoggingConfig {
                directory: PathBuf::from("logs"),
                file_prefix: "audiolab".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: Override server port
    /// - `APP_STORAGE__MODELS_DIR=/data/models`: Override models root
    /// - `APP_SERVER__CORS_ORIGINS=http://a,http://b`: Comma-separated list
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.performance.max_concurrent_downloads == 0 {
            return Err(anyhow!("Max concurrent downloads must be greater than 0"));
        }
        if self.performance.max_upload_mb == 0 {
            return Err(anyhow!("Max upload size must be greater than 0"));
        }
        if self.storage.models_dir.as_os_str().is_empty() {
            return Err(anyhow!("Models directory cannot be empty"));
        }
        if self.separation.command.trim().is_empty() {
            return Err(anyhow!("Separation command cannot be empty"));
        }
        self.device_preference()?;
        Ok(())
    }

    pub fn device_preference(&self) -> Result<DevicePreference> {
        self.models.device.parse().map_err(|e: String| anyhow!(e))
    }

    /// Upload limit in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.performance.max_upload_mb.saturating_mul(1024 * 1024)
    }
}
