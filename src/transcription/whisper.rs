//! # Whisper Model
//!
//! A Whisper checkpoint loaded into candle, ready to turn 16 kHz mono PCM into
//! timestamped text.
//!
//! ## Decoding Process:
//! 1. Convert PCM to a log-mel spectrogram
//! 2. Detect the spoken language when none was requested (multilingual models only)
//! 3. Walk the spectrogram in 30 second windows
//! 4. Greedy decode each window with timestamps, falling back to sampling at
//!    higher temperatures when the output is repetitive or unlikely
//! 5. Split decoded tokens into segments at timestamp tokens
//!
//! ## Thread Safety:
//! The candle decoder keeps a KV cache and needs `&mut` access, so the model
//! lives behind a `Mutex`. Concurrent transcriptions on the same model queue.

use crate::transcription::{mel, Segment, Task, TranscribeOptions, Transcriber, Transcript};
use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;

/// Seconds represented by one timestamp token step.
const TIME_PRECISION: f64 = 0.02;

/// Vocabulary size of multilingual checkpoints; English-only ones are one smaller.
const MULTILINGUAL_VOCAB: usize = 51865;

/// Language codes in the order of their tokens.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su", "yue",
];

struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    translate: u32,
    no_timestamps: u32,
    no_speech: Option<u32>,
}

struct DecoderState {
    model: m::model::Whisper,
    rng: StdRng,
}

struct DecodingResult {
    tokens: Vec<u32>,
    avg_logprob: f64,
    no_speech_prob: f64,
    repetitive: bool,
}

/// A loaded Whisper checkpoint.
pub struct WhisperModel {
    name: String,
    state: Mutex<DecoderState>,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
    /// Added to logits every step; `-inf` for suppressed tokens
    suppress: Tensor,
    /// (code, token id) for every language the tokenizer knows
    languages: Vec<(&'static str, u32)>,
}

impl WhisperModel {
    /// Load a checkpoint from a snapshot directory holding `config.json`,
    /// `tokenizer.json` and `model.safetensors`.
    pub fn load(snapshot_dir: &Path, device: Device) -> Result<Self> {
        let started = Instant::now();
        let name = snapshot_dir
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| snapshot_dir.display().to_string());
        tracing::info!(model = %name, device = ?device, "Loading Whisper weights");

        let config_file = std::fs::File::open(snapshot_dir.join("config.json"))
            .context("Missing config.json")?;
        let config: Config = serde_json::from_reader(config_file).context("Invalid config.json")?;

        let tokenizer = Tokenizer::from_file(snapshot_dir.join("tokenizer.json"))
            .map_err(|e| anyhow!("Failed to load tokenizer: {e}"))?;

        let weights = snapshot_dir.join("model.safetensors");
        if !weights.is_file() {
            bail!("Missing model.safetensors in {}", snapshot_dir.display());
        }
        // SAFETY: the weights file is not modified while mapped; deletion is
        // refused while a load is running.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            translate: token_id(&tokenizer, m::TRANSLATE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
        };

        let languages = if config.vocab_size >= MULTILINGUAL_VOCAB {
            LANGUAGES
                .iter()
                .filter_map(|code| {
                    tokenizer
                        .token_to_id(&format!("<|{code}|>"))
                        .map(|id| (*code, id))
                })
                .collect()
        } else {
            Vec::new()
        };

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) || i == tokens.no_timestamps {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;

        let mel_filters = mel::filter_bank(m::SAMPLE_RATE as u32, config.num_mel_bins);

        tracing::info!(
            model = %name,
            load_secs = started.elapsed().as_secs_f64(),
            multilingual = !languages.is_empty(),
            "Whisper model ready"
        );

        Ok(Self {
            name,
            state: Mutex::new(DecoderState {
                model,
                rng: StdRng::seed_from_u64(299_792_458),
            }),
            config,
            device,
            tokenizer,
            mel_filters,
            tokens,
            suppress,
            languages,
        })
    }

    fn language_token(&self, code: &str) -> Result<u32> {
        let code = code.trim().to_lowercase();
        self.languages
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, id)| *id)
            .ok_or_else(|| anyhow!("Language '{code}' is not supported by {}", self.name))
    }

    /// Pick the most likely language token for the first window of `mel`.
    fn detect_language(&self, model: &mut m::model::Whisper, mel: &Tensor) -> Result<(&'static str, u32)> {
        let (_, _, frames) = mel.dims3()?;
        let mel = mel.narrow(2, 0, usize::min(frames, m::N_FRAMES))?;
        let features = model.encoder.forward(&mel, true)?;

        let sot = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&sot, &features, true)?;
        let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let ids: Vec<u32> = self.languages.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let probs = softmax(&logits.index_select(&ids, 0)?, D::Minus1)?.to_vec1::<f32>()?;

        probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| self.languages[i])
            .ok_or_else(|| anyhow!("No language tokens to choose from"))
    }

    fn decode(
        &self,
        state: &mut DecoderState,
        mel: &Tensor,
        prompt: &[u32],
        temperature: f64,
    ) -> Result<DecodingResult> {
        let DecoderState { model, rng } = state;
        let features = model.encoder.forward(mel, true)?;
        let sample_len = self.config.max_target_positions / 2;

        let mut tokens = prompt.to_vec();
        let mut generated = Vec::new();
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut repetitive = false;

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &features, i == 0)?;

            if i == 0 {
                if let Some(no_speech) = self.tokens.no_speech {
                    let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                    no_speech_prob = softmax(&logits, 0)?
                        .i(no_speech as usize)?
                        .to_scalar::<f32>()? as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress)?;

            let next = if temperature > 0.0 {
                let probs: Vec<f32> = softmax(&(&logits / temperature)?, 0)?.to_vec1()?;
                WeightedIndex::new(&probs)?.sample(rng) as u32
            } else {
                let values: Vec<f32> = logits.to_vec1()?;
                values
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map(|(i, _)| i as u32)
                    .unwrap_or(self.tokens.eot)
            };

            let prob = softmax(&logits, D::Minus1)?
                .i(next as usize)?
                .to_scalar::<f32>()? as f64;
            if next == self.tokens.eot || tokens.len() > self.config.max_target_positions {
                break;
            }
            if is_repetitive(&generated, next) {
                repetitive = true;
                break;
            }
            sum_logprob += prob.ln();
            tokens.push(next);
            generated.push(next);
        }

        Ok(DecodingResult {
            avg_logprob: sum_logprob / tokens.len() as f64,
            tokens: generated,
            no_speech_prob,
            repetitive,
        })
    }

    fn decode_with_fallback(
        &self,
        state: &mut DecoderState,
        mel: &Tensor,
        prompt: &[u32],
    ) -> Result<DecodingResult> {
        let last = m::TEMPERATURES.len() - 1;
        for (i, &temperature) in m::TEMPERATURES.iter().enumerate() {
            let result = self.decode(state, mel, prompt, temperature);
            if i == last {
                return result;
            }
            match result {
                Ok(result) => {
                    let needs_fallback =
                        result.repetitive || result.avg_logprob < m::LOGPROB_THRESHOLD;
                    if !needs_fallback || result.no_speech_prob > m::NO_SPEECH_THRESHOLD {
                        return Ok(result);
                    }
                    tracing::debug!(temperature, avg_logprob = result.avg_logprob, "Retrying window at higher temperature");
                }
                Err(e) => tracing::warn!(temperature, error = %e, "Decoding failed, retrying"),
            }
        }
        bail!("No decoding temperatures configured")
    }

    fn decode_text(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))
    }
}

impl Transcriber for WhisperModel {
    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript> {
        if samples.is_empty() {
            bail!("Audio data is empty");
        }
        let started = Instant::now();
        let duration = samples.len() as f64 / m::SAMPLE_RATE as f64;

        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let mel_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_frames), &self.device)?;
        let content_frames = (samples.len() / m::HOP_LENGTH).clamp(1, mel_frames);

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("Model {} is poisoned by an earlier panic", self.name))?;

        let (language, language_token) = match (&options.language, self.languages.is_empty()) {
            (_, true) => ("en".to_string(), None),
            (Some(code), false) => (code.to_lowercase(), Some(self.language_token(code)?)),
            (None, false) => {
                let (code, id) = self.detect_language(&mut state.model, &mel)?;
                tracing::debug!(language = code, "Detected language");
                (code.to_string(), Some(id))
            }
        };

        let mut prompt = vec![self.tokens.sot];
        prompt.extend(language_token);
        prompt.push(match options.task {
            Task::Transcribe => self.tokens.transcribe,
            Task::Translate => self.tokens.translate,
        });

        let timestamp_begin = self.tokens.no_timestamps + 1;
        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let offset = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let window = usize::min(content_frames - seek, m::N_FRAMES);
            let window_secs = (window * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let mel_window = mel.narrow(2, seek, window)?;
            seek += window;

            let result = self.decode_with_fallback(&mut state, &mel_window, &prompt)?;
            if result.no_speech_prob > m::NO_SPEECH_THRESHOLD
                && result.avg_logprob < m::LOGPROB_THRESHOLD
            {
                tracing::debug!(offset, no_speech_prob = result.no_speech_prob, "Skipping silent window");
                continue;
            }

            let pieces = split_timestamped(
                &result.tokens,
                timestamp_begin,
                self.tokens.eot,
                window_secs,
                |tokens| self.decode_text(tokens),
            )?;
            for (start, end, text) in pieces {
                segments.push(Segment {
                    id: segments.len(),
                    start: offset + start,
                    end: (offset + end).min(duration),
                    text,
                });
            }
        }

        tracing::debug!(
            model = %self.name,
            audio_secs = duration,
            elapsed_secs = started.elapsed().as_secs_f64(),
            segments = segments.len(),
            "Transcription finished"
        );

        Ok(Transcript::from_segments(segments, language, duration))
    }

    fn describe(&self) -> String {
        format!("{} on {:?}", self.name, self.device)
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no id for {token}"))
}

/// Whether appending `next` would make the tail of `tokens` loop.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 3 && tokens[n - 3..] == [next, next, next] {
        return true;
    }
    // a 4-token phrase about to repeat for the third time
    if n >= 11 {
        let phrase = [tokens[n - 3], tokens[n - 2], tokens[n - 1], next];
        let first = &tokens[n - 11..n - 7];
        let second = &tokens[n - 7..n - 3];
        return first == phrase && second == phrase;
    }
    false
}

/// Split decoded tokens into `(start, end, text)` pieces at timestamp tokens.
///
/// Times are relative to the window start. Text after the last timestamp runs
/// to `window_secs`. Special tokens are dropped and blank pieces skipped.
fn split_timestamped(
    tokens: &[u32],
    timestamp_begin: u32,
    eot: u32,
    window_secs: f64,
    decode: impl Fn(&[u32]) -> Result<String>,
) -> Result<Vec<(f64, f64, String)>> {
    let mut pieces = Vec::new();
    let mut pending: Vec<u32> = Vec::new();
    let mut start = 0.0;

    let mut flush = |pending: &mut Vec<u32>, start: f64, end: f64| -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let text = decode(pending)?;
        pending.clear();
        let text = text.trim();
        if !text.is_empty() {
            pieces.push((start, end.max(start), text.to_string()));
        }
        Ok(())
    };

    for &token in tokens {
        if token >= timestamp_begin {
            let time = f64::from(token - timestamp_begin) * TIME_PRECISION;
            flush(&mut pending, start, time)?;
            start = time;
        } else if token < eot {
            pending.push(token);
        }
    }
    flush(&mut pending, start, window_secs)?;

    Ok(pieces)
}
