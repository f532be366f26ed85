//! # Model Management REST API Handlers
//!
//! HTTP endpoints over the model lifecycle manager.
//!
//! ## Available Endpoints:
//! - `GET /api/models` - Known models and their descriptors
//! - `GET /api/model/status?model_name=` - Lifecycle phase of one model
//! - `POST /api/model/download?model_name=&revision=` - Start a background download
//! - `DELETE /api/model/delete?model_name=` - Release and delete a model

use crate::error::AppError;
use crate::models::{registry, DeleteOutcome, DownloadOutcome};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    pub model_name: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub model_name: String,
    pub revision: Option<String>,
}

/// List every known model.
///
/// ## Endpoint: `GET /api/models`
///
/// ## Response:
/// ```json
/// {
///   "models": {
///     "base": { "name": "Base", "description": "...", "size_mb": 74, "speed": "fast", "accuracy": "medium" }
///   },
///   "message": "..."
/// }
/// ```
pub async fn list_models() -> HttpResponse {
    let models = registry::describe_all();
    info!(count = models.len(), "Listing models");
    HttpResponse::Ok().json(json!({
        "models": models,
        "message": format!("{} models available", models.len())
    }))
}

/// Lifecycle status of one model. Never fails; unknown names are `not_downloaded`.
///
/// ## Endpoint: `GET /api/model/status?model_name=base`
///
/// ## Response:
/// ```json
/// { "model_name": "base", "status": "downloading", "progress": 42, "message": "Downloading model.safetensors" }
/// ```
pub async fn model_status(
    state: web::Data<AppState>,
    query: web::Query<ModelQuery>,
) -> HttpResponse {
    let status = state.models.get_status(query.model_name.trim());
    HttpResponse::Ok().json(status)
}

/// Trigger a background download. Returns immediately.
///
/// ## Endpoint: `POST /api/model/download?model_name=small&revision=main`
///
/// ## Errors:
/// - 404 when the name is neither a known model nor an `owner/name` repository
pub async fn download_model(
    state: web::Data<AppState>,
    query: web::Query<DownloadQuery>,
) -> Result<HttpResponse, AppError> {
    let query = query.into_inner();
    let model_name = registry::resolve(&query.model_name)?.to_string();
    let revision = query.revision.filter(|r| !r.trim().is_empty());

    let body = match state.models.download(&model_name, revision.clone()) {
        DownloadOutcome::Started => json!({
            "message": "Download started",
            "model_name": model_name,
            "revision": revision,
            "status": "downloading"
        }),
        DownloadOutcome::AlreadyLoaded => json!({
            "message": "Model is already loaded",
            "model_name": model_name,
            "status": "loaded"
        }),
        DownloadOutcome::InProgress => json!({
            "message": "Model is already being downloaded or loaded",
            "model_name": model_name,
            "status": state.models.get_status(&model_name).status
        }),
    };

    Ok(HttpResponse::Ok().json(body))
}

/// Release a model from memory and delete its files.
///
/// ## Endpoint: `DELETE /api/model/delete?model_name=base`
///
/// ## Errors:
/// - 404 for unknown names
/// - 409 while the model is downloading or loading
/// - 500 when the files cannot be removed
pub async fn delete_model(
    state: web::Data<AppState>,
    query: web::Query<ModelQuery>,
) -> Result<HttpResponse, AppError> {
    let model_name = registry::resolve(&query.model_name)?.to_string();

    let models = state.models.clone();
    let name = model_name.clone();
    let outcome = web::block(move || models.delete(&name)).await??;

    let message = match outcome {
        DeleteOutcome::Deleted => format!("Model {} deleted", model_name),
        DeleteOutcome::NothingToDelete => {
            format!("Model {} has no files to delete, it may already be deleted", model_name)
        }
    };
    Ok(HttpResponse::Ok().json(json!({
        "message": message,
        "model_name": model_name,
        "deleted": outcome == DeleteOutcome::Deleted
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::registry::model_dir;
    use crate::state::test_support::state_in;
    use actix_web::{http::StatusCode, test, App};

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/api/models", web::get().to(list_models))
                    .route("/api/model/status", web::get().to(model_status))
                    .route("/api/model/download", web::post().to(download_model))
                    .route("/api/model/delete", web::delete().to(delete_model)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_list_models() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(state_in(dir.path()));

        let req = test::TestRequest::get().uri("/api/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["models"]["base"]["size_mb"], 74);
        assert!(body["models"]["large-v3"].is_object());
    }

    #[actix_web::test]
    async fn test_status_reflects_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        std::fs::create_dir_all(model_dir(state.models.models_root(), "tiny")).unwrap();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/model/status?model_name=tiny").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "downloaded");

        let req = test::TestRequest::get().uri("/api/model/status?model_name=small").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "not_downloaded");
    }

    #[actix_web::test]
    async fn test_download_unknown_model_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(state_in(dir.path()));

        let req = test::TestRequest::post()
            .uri("/api/model/download?model_name=gigantic")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_download_failure_ends_in_error_phase() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let models = state.models.clone();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/model/download?model_name=base")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "downloading");

        // the offline loader fails straight away
        let mut phase = models.get_status("base").status;
        for _ in 0..200 {
            if phase == crate::models::manager::ModelPhase::Error {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            phase = models.get_status("base").status;
        }
        assert_eq!(phase, crate::models::manager::ModelPhase::Error);
    }

    #[actix_web::test]
    async fn test_delete_loaded_then_nothing_left() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        std::fs::create_dir_all(model_dir(state.models.models_root(), "base")).unwrap();
        assert!(matches!(state.models.get_model("base"), crate::models::ModelLookup::Ready(_)));
        let app = app!(state);

        let req = test::TestRequest::delete().uri("/api/model/delete?model_name=base").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["deleted"], true);

        let req = test::TestRequest::delete().uri("/api/model/delete?model_name=base").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["deleted"], false);
    }
}
