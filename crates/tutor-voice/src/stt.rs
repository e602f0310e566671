//! Speech-to-text: turn a finalized [`AudioSpan`] into the learner's words.
//!
//! The loop only depends on [`Recognizer`]. [`HttpRecognizer`] posts the span as
//! 16-bit WAV to an OpenAI-compatible `/audio/transcriptions` endpoint.

use crate::audio::AudioSpan;
use crate::error::RecognitionError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Recognition capability. Returns an empty string when nothing intelligible was said.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn transcribe(&self, span: &AudioSpan) -> Result<String, RecognitionError>;
}

/// Encode f32 PCM (mono) as 16-bit little-endian WAV.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32; // 16-bit = 2 bytes per sample
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// Map a non-success HTTP status to a recognition error. Auth failures and
/// missing endpoints will not fix themselves; everything else is retried.
fn status_error(status: StatusCode, body: &str) -> RecognitionError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            RecognitionError::Unavailable(format!("STT API error {}: {}", status, body))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RecognitionError::Timeout,
        _ => RecognitionError::Network(format!("STT API error {}: {}", status, body)),
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, OpenRouter, a local server).
/// Uses `STT_API_URL` (default https://api.openai.com/v1), `STT_API_KEY`, and
/// `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// ISO-639-1 hint for the lesson language, if known.
    pub language: Option<String>,
    client: reqwest::Client,
}

impl HttpRecognizer {
    /// Build from environment: STT_API_URL, STT_API_KEY (or OPENROUTER_API_KEY), STT_MODEL.
    pub fn from_env() -> Result<Self, RecognitionError> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| {
                RecognitionError::Unavailable(
                    "STT requires STT_API_KEY or OPENROUTER_API_KEY".to_string(),
                )
            })?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RecognitionError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            language: None,
            client,
        })
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn transcribe(&self, span: &AudioSpan) -> Result<String, RecognitionError> {
        if span.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_f32_to_wav(&span.samples, span.sample_rate);
        debug!("📤 Uploading {} bytes of WAV for transcription", wav.len());

        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| RecognitionError::Network(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let parsed: TranscriptionResponse = res
            .json()
            .await
            .map_err(|e| RecognitionError::Network(format!("bad transcription body: {}", e)))?;
        Ok(parsed.text.trim().to_string())
    }
}
