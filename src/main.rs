//! # AudioLab Backend - Main Application Entry Point
//!
//! Local HTTP service for speech-to-text, subtitle translation and source
//! separation, with download and lifecycle management of the speech models.
//!
//! ## Application Architecture:
//! - **config**: process configuration (TOML file + environment variables)
//! - **settings**: user-editable JSON settings (default model, translation API)
//! - **models**: model registry, lifecycle manager and hub loader
//! - **transcription**: Whisper speech recognition on candle
//! - **audio**: decoding uploads into 16 kHz mono samples
//! - **subtitle**: SRT parsing and rendering
//! - **translation**: chat-completions client for subtitle translation
//! - **separation**: Demucs stem separation
//! - **state / health / middleware / handlers / error**: the HTTP layer

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod models;
mod separation;
mod settings;
mod state;
mod subtitle;
mod transcription;
mod translation;

use crate::config::{AppConfig, LoggingConfig};
use crate::device::DeviceManager;
use crate::models::{ModelLoader, ModelManager, WhisperLoader};
use crate::settings::SettingsStore;
use crate::state::AppState;
use crate::transcription::Transcriber;
use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## Startup order:
/// 1. `.env`, then configuration (logging needs the log directory)
/// 2. Tracing to console and a daily log file
/// 3. Compute device, model manager, settings store
/// 4. HTTP server until it stops or a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate()?;

    // Dropping the guard stops the file writer, so it lives until main returns
    let _log_guard = init_tracing(&config.logging)?;

    info!("Starting audiolab-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    for dir in [&config.storage.models_dir, &config.storage.uploads_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let device = DeviceManager::get_device(config.device_preference()?);
    let device_info = DeviceManager::get_device_info(&device);
    info!(device = %device_info, models_dir = %config.storage.models_dir.display(), "Model runtime ready");

    let loader: Arc<dyn ModelLoader<dyn Transcriber>> = Arc::new(WhisperLoader::new(device));
    let models = ModelManager::new(
        config.storage.models_dir.clone(),
        loader,
        config.performance.max_concurrent_downloads,
    );
    let settings = SettingsStore::new(config.storage.settings_file.clone());
    info!(path = %settings.path().display(), "Settings loaded");
    let app_state = AppState::new(config.clone(), models, settings, device_info);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let cors_origins = config.server.cors_origins.clone();
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // middleware runs bottom-up on requests
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(build_cors(&cors_origins))
            .route("/", web::get().to(health::index))
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/models", web::get().to(handlers::list_models))
                    .route("/model/status", web::get().to(handlers::model_status))
                    .route("/model/download", web::post().to(handlers::download_model))
                    .route("/model/delete", web::delete().to(handlers::delete_model))
                    .route("/upload", web::post().to(handlers::upload_audio))
                    .route("/process", web::post().to(handlers::process_audio))
                    .route("/transcribe", web::post().to(handlers::transcribe_audio))
                    .route("/translate-srt", web::post().to(handlers::translate_srt))
                    .route("/separate-voice", web::post().to(handlers::separate_voice))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::post().to(handlers::update_config))
                    .route("/config/validate", web::get().to(handlers::validate_config)),
            )
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console output plus a daily-rotated file under `logging.directory`.
///
/// ## Environment Variables:
/// - `RUST_LOG`: filter directives; defaults to "audiolab_backend=debug,actix_web=info"
fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.directory)
        .with_context(|| format!("Failed to create log directory {}", logging.directory.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        &logging.directory,
        &logging.file_prefix,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiolab_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_ids(true),
        )
        .init();

    Ok(guard)
}

/// Allow the configured origins; `*` allows any origin.
fn build_cors(origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        // browsers need these to read attachment names and request ids
        .expose_headers(vec![
            header::CONTENT_DISPOSITION,
            HeaderName::from_static(middleware::logging::REQUEST_ID_HEADER),
        ])
        .max_age(3600);

    if origins.iter().any(|o| o == "*") {
        return cors.allow_any_origin();
    }
    origins
        .iter()
        .fold(cors, |cors, origin| cors.allowed_origin(origin))
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
