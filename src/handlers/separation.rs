//! `POST /api/separate-voice`: split an uploaded mix into stems.
//!
//! One requested stem comes back as a WAV attachment; several come back as a
//! ZIP of `<name>_<stem>.wav` entries.

use crate::error::AppError;
use crate::handlers::form::{sanitize_filename, UploadForm};
use crate::separation::{self, parse_stems, Separator, DEFAULT_MODEL};
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::http::header::ContentDisposition;
use actix_web::{web, HttpResponse};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_STEMS: &str = "vocals";

/// Scratch directory removed when dropped.
struct WorkDir(PathBuf);

impl WorkDir {
    fn create(parent: &Path) -> std::io::Result<Self> {
        let path = parent.join(format!("separation-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            warn!(path = %self.0.display(), error = %e, "Failed to remove separation work directory");
        }
    }
}

enum Separated {
    Wav { name: String, bytes: Vec<u8> },
    Zip { name: String, bytes: Vec<u8> },
}

/// ## Form fields:
/// - `file`: audio/* upload
/// - `model`: Demucs checkpoint, default `htdemucs`
/// - `stems`: comma-separated subset of `drums,bass,other,vocals`, default `vocals`
pub async fn separate_voice(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut form = UploadForm::read(payload, state.config.max_upload_bytes()).await?;
    let file = form.take_audio()?;
    let model = form.field("model").unwrap_or(DEFAULT_MODEL).to_string();
    let stems = parse_stems(form.field("stems").unwrap_or(DEFAULT_STEMS))?;
    let command = state.config.separation.command.clone();
    let scratch_root = state.config.storage.uploads_dir.clone();

    info!(filename = %file.filename, model = %model, stems = ?stems, "Separation requested");
    let _job = state.begin_job();

    let result = web::block(move || -> Result<Separated, AppError> {
        let separator = Separator::load_pretrained(&model, &command)?;
        debug!(model = %separator.model(), "Running separation");
        let work = WorkDir::create(&scratch_root)?;
        let input = work.0.join(sanitize_filename(&file.filename));
        std::fs::write(&input, &file.bytes)?;

        let outputs = separator.apply(&input, &work.0, &stems)?;
        let stem_name = file.stem();
        match outputs.as_slice() {
            [single] => Ok(Separated::Wav {
                name: format!("{}_{}.wav", stem_name, single.stem.as_str()),
                bytes: std::fs::read(&single.path)?,
            }),
            _ => Ok(Separated::Zip {
                name: format!("{}_stems.zip", stem_name),
                bytes: separation::bundle(&outputs, &stem_name)?,
            }),
        }
    })
    .await??;

    Ok(match result {
        Separated::Wav { name, bytes } => HttpResponse::Ok()
            .content_type("audio/wav")
            .insert_header(ContentDisposition::attachment(name))
            .body(bytes),
        Separated::Zip { name, bytes } => HttpResponse::Ok()
            .content_type("application/zip")
            .insert_header(ContentDisposition::attachment(name))
            .body(bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::form::test_support::{body, content_type, wav_bytes, Part};
    use crate::state::test_support::state_in;
    use actix_web::{http::header, http::StatusCode, test, App};

    fn request(parts: &[Part<'_>]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/api/separate-voice")
            .insert_header((header::CONTENT_TYPE, content_type()))
            .set_payload(body(parts))
    }

    #[actix_web::test]
    async fn test_unknown_stem_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_in(dir.path())))
                .route("/api/separate-voice", web::post().to(separate_voice)),
        )
        .await;

        let wav = wav_bytes(16_000, 0.1);
        let req = request(&[
            Part::File { filename: "mix.wav", content_type: "audio/wav", bytes: &wav },
            Part::Text("stems", "piano"),
        ])
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    fn install_fake_demucs(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-demucs");
        std::fs::write(
            &script,
            "#!/bin/sh\nmodel=\"$2\"; out=\"$4\"\nmkdir -p \"$out/$model\"\n\
             for s in drums bass other vocals; do echo \"$s\" > \"$out/$model/$s.wav\"; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[cfg(unix)]
    #[actix_web::test]
    async fn test_single_stem_is_wav_and_several_are_zip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let mut config = (*state.config).clone();
        config.separation.command = install_fake_demucs(dir.path());
        state.config = std::sync::Arc::new(config);
        let uploads = state.config.storage.uploads_dir.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/separate-voice", web::post().to(separate_voice)),
        )
        .await;

        let wav = wav_bytes(16_000, 0.1);
        let req = request(&[Part::File { filename: "song.wav", content_type: "audio/wav", bytes: &wav }]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "audio/wav");
        assert_eq!(&test::read_body(resp).await[..], b"vocals\n");

        let req = request(&[
            Part::File { filename: "song.wav", content_type: "audio/wav", bytes: &wav },
            Part::Text("stems", "drums,vocals"),
        ])
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "application/zip");
        let bytes = test::read_body(resp).await;
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["song_drums.wav", "song_vocals.wav"]);

        // scratch directories are cleaned up
        assert_eq!(std::fs::read_dir(&uploads).unwrap().count(), 0);
    }
}
