//! # Subtitle Translation
//!
//! Translates SRT entries one at a time through an OpenAI-compatible
//! chat-completions endpoint. Timing is never sent to the model; only the
//! text of each entry is translated and written back in place.

use crate::settings::Settings;
use crate::subtitle::SubtitleEntry;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Entries translated concurrently.
const PARALLEL_REQUESTS: usize = 4;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("Translation API key is not configured")]
    ApiKeyMissing,

    #[error("Translation request timed out")]
    Timeout,

    #[error("Translation request failed: {0}")]
    RequestFailed(String),

    #[error("Translation API returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Invalid translation API response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for TranslationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TranslationError::Timeout
        } else {
            TranslationError::RequestFailed(err.to_string())
        }
    }
}

/// Chat-completions client configured from [`Settings`].
pub struct Translator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl Translator {
    pub fn from_settings(settings: &Settings) -> Result<Self, TranslationError> {
        if !settings.has_api_key() {
            return Err(TranslationError::ApiKeyMissing);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TranslationError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: chat_endpoint(&settings.openai_base_url),
            api_key: settings.openai_api_key.clone(),
            model: settings.openai_model.clone(),
            temperature: settings.openai_temperature,
            max_tokens: settings.openai_max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Translate one piece of subtitle text.
    pub async fn translate_text(
        &self,
        text: &str,
        target_language: &str,
        source_language: Option<&str>,
    ) -> Result<String, TranslationError> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }

        let system = system_prompt(target_language, source_language);
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage { role: "system", content: &system },
                ChatMessage { role: "user", content: text },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Translation API error: {}", body);
            return Err(TranslationError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| TranslationError::InvalidResponse("Empty completion".to_string()))
    }

    /// Translate the text of every entry, keeping order and timing.
    pub async fn translate_entries(
        &self,
        entries: Vec<SubtitleEntry>,
        target_language: &str,
        source_language: Option<&str>,
    ) -> Result<Vec<SubtitleEntry>, TranslationError> {
        info!(
            entries = entries.len(),
            model = %self.model,
            target = target_language,
            "Translating subtitles"
        );

        let translated: Vec<SubtitleEntry> = stream::iter(entries)
            .map(|entry| async move {
                let text = self
                    .translate_text(&entry.text, target_language, source_language)
                    .await?;
                debug!(index = entry.index, "Translated entry");
                Ok::<_, TranslationError>(SubtitleEntry { text, ..entry })
            })
            .buffered(PARALLEL_REQUESTS)
            .try_collect()
            .await?;

        Ok(translated)
    }
}

fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn system_prompt(target_language: &str, source_language: Option<&str>) -> String {
    let source = source_language
        .filter(|s| !s.trim().is_empty())
        .map(|s| format!(" from {s}"))
        .unwrap_or_default();
    format!(
        "You are a professional subtitle translator. Translate the subtitle text{source} into \
         {target_language}. Keep line breaks, keep it concise, and reply with the translation only."
    )
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};

    fn settings(base_url: &str) -> Settings {
        Settings {
            openai_api_key: "test-key".into(),
            openai_model: "test-model".into(),
            openai_base_url: base_url.into(),
            ..Settings::default()
        }
    }

    /// Upstream that upper-cases the user message.
    async fn fake_completions(req: actix_web::HttpRequest, body: web::Json<serde_json::Value>) -> HttpResponse {
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer test-key" {
            return HttpResponse::Unauthorized().body("bad key");
        }
        let text = body["messages"][1]["content"].as_str().unwrap_or_default().to_uppercase();
        HttpResponse::Ok().json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": text } }]
        }))
    }

    fn spawn_upstream() -> String {
        let server = HttpServer::new(|| {
            App::new().route("/v1/chat/completions", web::post().to(fake_completions))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("http://{addr}/v1")
    }

    #[test]
    fn test_chat_endpoint() {
        assert_eq!(chat_endpoint(""), "https://api.openai.com/v1/chat/completions");
        assert_eq!(chat_endpoint("http://localhost:8080/v1/"), "http://localhost:8080/v1/chat/completions");
        assert_eq!(chat_endpoint("http://x/v1/chat/completions"), "http://x/v1/chat/completions");
    }

    #[test]
    fn test_system_prompt_mentions_languages() {
        assert!(system_prompt("French", Some("English")).contains("from English into French"));
        assert!(system_prompt("French", Some(" ")).contains("text into French"));
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let result = Translator::from_settings(&Settings {
            openai_api_key: String::new(),
            ..Settings::default()
        });
        assert!(matches!(result, Err(TranslationError::ApiKeyMissing)));
    }

    #[actix_web::test]
    async fn test_translate_entries_keeps_order_and_timing() {
        let base = spawn_upstream();
        let translator = Translator::from_settings(&settings(&base)).unwrap();

        let entries: Vec<SubtitleEntry> = (1..=6)
            .map(|i| SubtitleEntry {
                index: i,
                start_ms: i as u64 * 1000,
                end_ms: i as u64 * 1000 + 500,
                text: format!("line {i}"),
            })
            .collect();

        let translated = translator.translate_entries(entries, "shouting", None).await.unwrap();
        assert_eq!(translated.len(), 6);
        assert_eq!(translated[0].text, "LINE 1");
        assert_eq!(translated[5].text, "LINE 6");
        assert_eq!(translated[5].start_ms, 6000);
    }

    #[actix_web::test]
    async fn test_upstream_error_is_reported() {
        let base = spawn_upstream();
        let translator = Translator::from_settings(&Settings {
            openai_api_key: "wrong".into(),
            ..settings(&base)
        })
        .unwrap();

        let result = translator.translate_text("hello", "fr", None).await;
        assert!(matches!(result, Err(TranslationError::Upstream { status: 401, .. })));
    }
}
