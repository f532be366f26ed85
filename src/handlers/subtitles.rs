//! `POST /api/translate-srt`: translate the text of an SRT file and return it
//! as an attachment with the original timing.

use crate::error::{AppError, AppResult};
use crate::handlers::form::UploadForm;
use crate::state::AppState;
use crate::subtitle;
use crate::translation::Translator;
use actix_multipart::Multipart;
use actix_web::http::header::ContentDisposition;
use actix_web::{web, HttpResponse};
use tracing::info;

/// SRT files are small; anything past this is not a subtitle file.
const MAX_SRT_BYTES: usize = 10 * 1024 * 1024;

/// ## Form fields:
/// - `file`: the `.srt` file
/// - `target_language`: required, e.g. `French` or `fr`
/// - `source_language`: optional hint
///
/// ## Errors:
/// - 400 for malformed SRT or a missing API key
/// - 502 when the translation API fails
pub async fn translate_srt(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut form = UploadForm::read(payload, MAX_SRT_BYTES).await?;
    let file = form.take_file()?;
    let target_language = form
        .field("target_language")
        .ok_or_else(|| AppError::ValidationError("target_language is required".to_string()))?
        .to_string();
    let source_language = form.field("source_language").map(str::to_string);

    let stem = file.stem();
    let filename = file.filename.clone();
    let content = decode_text(file.bytes)?;
    let entries = subtitle::parse(&content)?;

    let translator = Translator::from_settings(&state.settings.load())?;
    info!(
        filename = %filename,
        entries = entries.len(),
        target = %target_language,
        model = %translator.model(),
        "Translating subtitle file"
    );
    let _job = state.begin_job();

    let translated = translator
        .translate_entries(entries, &target_language, source_language.as_deref())
        .await?;

    let out_name = format!("{}_{}.srt", stem, language_suffix(&target_language));
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header(ContentDisposition::attachment(out_name))
        .body(subtitle::serialize(&translated)))
}

fn decode_text(bytes: Vec<u8>) -> AppResult<String> {
    String::from_utf8(bytes)
        .map_err(|_| AppError::BadRequest("Subtitle file must be UTF-8 text".to_string()))
}

/// File-name friendly form of a language name.
fn language_suffix(language: &str) -> String {
    let suffix: String = language
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_lowercase();
    if suffix.is_empty() {
        "translated".to_string()
    } else {
        suffix
    }
}
