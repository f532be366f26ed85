//! Multipart form reading shared by the upload-style endpoints.
//!
//! Every form carries at most one file part named `file`; every other part is
//! read as a short UTF-8 text field.

use crate::error::{AppError, AppResult};
use actix_multipart::{Field, Multipart};
use futures_util::stream::StreamExt;
use std::collections::HashMap;

pub const FILE_FIELD: &str = "file";

/// Text fields larger than this are rejected.
const MAX_TEXT_FIELD: usize = 64 * 1024;

/// The uploaded file part.
#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn is_audio(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("audio/"))
    }

    /// File name without directories or extension, safe for headers and paths.
    pub fn stem(&self) -> String {
        let safe = sanitize_filename(&self.filename);
        match safe.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => safe,
        }
    }
}

/// A fully read multipart form.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub file: Option<UploadedFile>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    /// Drain `payload`, failing once the file grows beyond `max_file_bytes`.
    pub async fn read(mut payload: Multipart, max_file_bytes: usize) -> AppResult<Self> {
        let mut form = UploadForm::default();

        while let Some(item) = payload.next().await {
            let mut field: Field = item?;
            let content_disposition = field
                .content_disposition()
                .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;
            let name = content_disposition
                .get_name()
                .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
                .to_string();
            let filename = content_disposition.get_filename().map(str::to_string);

            if name == FILE_FIELD {
                let content_type = field.content_type().map(|mime| mime.to_string());
                let bytes = read_field(&mut field, max_file_bytes, &name).await?;
                form.file = Some(UploadedFile {
                    filename: filename.unwrap_or_else(|| "upload".to_string()),
                    content_type,
                    bytes,
                });
            } else {
                let bytes = read_field(&mut field, MAX_TEXT_FIELD, &name).await?;
                form.fields
                    .insert(name, String::from_utf8_lossy(&bytes).into_owned());
            }
        }

        Ok(form)
    }

    /// Trimmed value of a text field; blank values count as absent.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn take_file(&mut self) -> AppResult<UploadedFile> {
        let file = self
            .file
            .take()
            .ok_or_else(|| AppError::BadRequest("No file uploaded".to_string()))?;
        if file.bytes.is_empty() {
            return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
        }
        Ok(file)
    }

    /// Like [`take_file`](Self::take_file), but only accepts `audio/*` uploads.
    pub fn take_audio(&mut self) -> AppResult<UploadedFile> {
        let file = self.take_file()?;
        if !file.is_audio() {
            return Err(AppError::BadRequest(format!(
                "Only audio files are supported, got {}",
                file.content_type.as_deref().unwrap_or("no content type")
            )));
        }
        Ok(file)
    }
}

async fn read_field(field: &mut Field, limit: usize, name: &str) -> AppResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > limit {
            return Err(AppError::ValidationError(format!(
                "Field '{}' is too large (max: {} bytes)",
                name, limit
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Keep only the last path component and replace anything outside
/// `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Multipart bodies for handler tests.

    pub const BOUNDARY: &str = "audiolab-test-boundary";

    pub enum Part<'a> {
        Text(&'a str, &'a str),
        File {
            filename: &'a str,
            content_type: &'a str,
            bytes: &'a [u8],
        },
    }

    pub fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    pub fn body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    out.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
                    );
                }
                Part::File {
                    filename,
                    content_type,
                    bytes,
                } => {
                    out.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                             Content-Type: {content_type}\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    out.extend_from_slice(bytes);
                    out.extend_from_slice(b"\r\n");
                }
            }
        }
        out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        out
    }

    /// One second of 16 kHz mono 16-bit silence-ish tone as a WAV file.
    pub fn wav_bytes(sample_rate: u32, seconds: f32) -> Vec<u8> {
        let frames = (sample_rate as f32 * seconds) as u32;
        let data_len = frames * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}
