//! # Audio Handlers
//!
//! - `POST /api/upload` - store an audio file in the uploads directory
//! - `POST /api/process` - report duration, sample rate and channels of an upload
//! - `POST /api/transcribe` - speech to text as JSON or an SRT attachment
//!
//! Decoding and inference are CPU-bound and run on the blocking pool through
//! `web::block`, as does the on-disk model load done by `get_model`.

use crate::audio;
use crate::error::{AppError, AppResult};
use crate::handlers::form::{sanitize_filename, UploadForm};
use crate::models::ModelLookup;
use crate::state::AppState;
use crate::subtitle;
use crate::transcription::{Task, TranscribeOptions, Transcript, SAMPLE_RATE};
use actix_multipart::Multipart;
use actix_web::http::header::ContentDisposition;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::{debug, info, warn};

/// Save an uploaded audio file.
///
/// ## Endpoint: `POST /api/upload` (multipart, field `file`)
pub async fn upload_audio(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut form = UploadForm::read(payload, state.config.max_upload_bytes()).await?;
    let file = form.take_audio()?;
    info!(filename = %file.filename, size = file.bytes.len(), "Uploading audio file");

    let uploads_dir = state.config.storage.uploads_dir.clone();
    let filename = sanitize_filename(&file.filename);
    let path = uploads_dir.join(&filename);
    let size = file.bytes.len();

    let saved = path.clone();
    web::block(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&uploads_dir)?;
        std::fs::write(&saved, &file.bytes)
    })
    .await??;

    info!(path = %path.display(), size, "Audio file saved");
    Ok(HttpResponse::Ok().json(json!({
        "message": "File uploaded",
        "filename": filename,
        "size": size,
        "file_path": path.display().to_string()
    })))
}

/// Inspect an uploaded audio file.
///
/// ## Endpoint: `POST /api/process` (multipart, fields `file`, `operation?`)
pub async fn process_audio(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut form = UploadForm::read(payload, state.config.max_upload_bytes()).await?;
    let operation = form.field("operation").unwrap_or("analyze").to_string();
    let file = form.take_file()?;
    let file_size = file.bytes.len();
    info!(filename = %file.filename, operation = %operation, "Processing audio file");

    let filename = file.filename.clone();
    let info = web::block(move || audio::probe(file.bytes, &file.filename)).await??;

    Ok(HttpResponse::Ok().json(json!({
        "message": "Audio processed",
        "filename": filename,
        "operation": operation,
        "file_size": file_size,
        "duration": info.duration_hms(),
        "duration_seconds": info.duration,
        "sample_rate": info.sample_rate,
        "channels": info.channels,
        "format": info.format
    })))
}

/// Output of `/api/transcribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Srt,
}

impl OutputFormat {
    fn parse(value: Option<&str>) -> AppResult<Self> {
        match value.map(str::to_lowercase).as_deref() {
            None | Some("json") => Ok(OutputFormat::Json),
            Some("srt") => Ok(OutputFormat::Srt),
            Some(other) => Err(AppError::ValidationError(format!(
                "Unsupported format '{}', expected json or srt",
                other
            ))),
        }
    }
}

fn parse_task(value: Option<&str>) -> AppResult<Task> {
    match value.map(str::to_lowercase).as_deref() {
        None | Some("transcribe") => Ok(Task::Transcribe),
        Some("translate") => Ok(Task::Translate),
        Some(other) => Err(AppError::ValidationError(format!(
            "Unsupported task '{}', expected transcribe or translate",
            other
        ))),
    }
}

/// Transcribe an uploaded audio file with a downloaded model.
///
/// ## Endpoint: `POST /api/transcribe`
///
/// ## Form fields:
/// - `file`: audio/* upload
/// - `model_name`: defaults to the `whisper_default_model` setting
/// - `language`: ISO code, or `auto`/absent to detect
/// - `task`: `transcribe` (default) or `translate` (to English)
/// - `format`: `json` (default) or `srt`
///
/// ## Errors:
/// - 400 when the model is not downloaded or fails to load
pub async fn transcribe_audio(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut form = UploadForm::read(payload, state.config.max_upload_bytes()).await?;
    let file = form.take_audio()?;
    let format = OutputFormat::parse(form.field("format"))?;
    let options = TranscribeOptions {
        language: form
            .field("language")
            .filter(|l| !l.eq_ignore_ascii_case("auto"))
            .map(str::to_lowercase),
        task: parse_task(form.field("task"))?,
    };
    let model_name = match form.field("model_name") {
        Some(name) => name.to_string(),
        None => state.settings.load().whisper_default_model,
    };

    info!(
        filename = %file.filename,
        model = %model_name,
        language = ?options.language,
        format = ?format,
        "Transcription requested"
    );
    let _job = state.begin_job();

    let models = state.models.clone();
    let lookup_name = model_name.clone();
    let model = match web::block(move || models.get_model(&lookup_name)).await? {
        ModelLookup::Ready(model) => model,
        ModelLookup::NotAvailable => {
            warn!(model = %model_name, "Model not available for transcription");
            return Err(not_available(&model_name));
        }
        ModelLookup::LoadFailed(reason) => {
            warn!(model = %model_name, reason = %reason, "Model failed to load for transcription");
            return Err(not_available(&model_name));
        }
    };

    debug!(model = %model.describe(), "Using loaded model");
    let started = std::time::Instant::now();
    let stem = file.stem();
    let original_name = file.filename.clone();
    let transcript: Transcript = web::block(move || -> AppResult<Transcript> {
        let audio = audio::decode(file.bytes, &file.filename, SAMPLE_RATE)?;
        debug!(seconds = audio.duration(), "Decoded audio for transcription");
        Ok(model.transcribe(&audio.samples, &options)?)
    })
    .await??;

    info!(
        filename = %original_name,
        language = %transcript.language,
        segments = transcript.segments.len(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Transcription finished"
    );

    match format {
        OutputFormat::Srt => {
            let srt_name = format!("{}.srt", stem);
            Ok(HttpResponse::Ok()
                .content_type("text/plain; charset=utf-8")
                .insert_header(ContentDisposition::attachment(srt_name))
                .body(subtitle::segments_to_srt(&transcript.segments)))
        }
        OutputFormat::Json => Ok(HttpResponse::Ok().json(json!({
            "message": "Transcription complete",
            "filename": original_name,
            "text": transcript.text,
            "language": transcript.language,
            "duration": transcript.duration,
            "segments": transcript.segments,
            "model_name": model_name
        }))),
    }
}

fn not_available(model_name: &str) -> AppError {
    AppError::BadRequest(format!(
        "Model {} is not downloaded or failed to load, download it first",
        model_name
    ))
}
