//! Settings endpoints. The API key never leaves the server unmasked.

use crate::error::AppError;
use crate::settings::{self, Settings};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// ## Endpoint: `GET /api/config`
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    let settings = state.settings.load();
    HttpResponse::Ok().json(json!({
        "config": settings.masked(),
        "has_api_key": settings.has_api_key(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// ## Endpoint: `POST /api/config`
///
/// Missing fields take their defaults; an empty `openai_api_key` keeps the
/// stored key.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<Settings>,
) -> Result<HttpResponse, AppError> {
    let incoming = body.into_inner();
    let report = settings::validate(&incoming);
    if !report.valid {
        return Err(AppError::ValidationError(report.errors.join("; ")));
    }

    let store = state.settings.clone();
    let updated = web::block(move || store.update(incoming)).await??;
    info!(
        default_model = %updated.whisper_default_model,
        translation_model = %updated.openai_model,
        "Settings saved"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated",
        "config": updated.masked(),
        "has_api_key": updated.has_api_key(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// ## Endpoint: `GET /api/config/validate`
pub async fn validate_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(settings::validate(&state.settings.load()))
}
