use crate::audio::wav::wav_bytes;
use crate::audio::Utterance;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by a [`Recognizer`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognitionError {
    #[error("speech was unintelligible")]
    Unintelligible,

    #[error("recognition provider failed: {0}")]
    Provider(String),

    #[error("recognition timed out")]
    Timeout,
}

impl From<RecognitionError> for crate::ParleyError {
    fn from(e: RecognitionError) -> Self {
        crate::ParleyError::Recognition(e.to_string())
    }
}

/// Converts a captured utterance to text.
///
/// Takes the utterance by value; the capturer keeps nothing once it is handed
/// over. Implementations block and are run off the orchestrator thread.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, utterance: Utterance) -> Result<String, RecognitionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionProvider {
    /// OpenAI-compatible `/audio/transcriptions` endpoint
    Http,
    /// Local whisper.cpp model (feature `whisper`)
    Whisper,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub provider: RecognitionProvider,

    /// Base URL of the transcription service
    pub endpoint: String,

    pub model: String,

    /// Bearer token; falls back to `PARLEY_STT_API_KEY`
    pub api_key: Option<String>,

    /// Language code passed to the recognizer
    pub language: String,

    /// Hard limit on one recognition
    pub timeout_ms: u64,

    /// ggml model file for the local provider
    pub model_path: Option<PathBuf>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            provider: RecognitionProvider::Http,
            endpoint: "http://localhost:8000/v1".to_string(),
            model: "whisper-1".to_string(),
            api_key: None,
            language: "en".to_string(),
            timeout_ms: 10_000,
            model_path: None,
        }
    }
}

impl RecognitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Recognizer backed by an OpenAI-compatible transcription API
pub struct HttpRecognizer {
    url: String,
    model: String,
    language: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpRecognizer {
    pub fn new(config: &RecognitionConfig) -> Result<Self, RecognitionError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RecognitionError::Provider(e.to_string()))?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("PARLEY_STT_API_KEY").ok());

        info!("Using transcription endpoint {} ({})", config.endpoint, config.model);

        Ok(Self {
            url: format!("{}/audio/transcriptions", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            language: config.language.clone(),
            api_key,
            client,
        })
    }
}

impl Recognizer for HttpRecognizer {
    fn recognize(&self, utterance: Utterance) -> Result<String, RecognitionError> {
        let samples = utterance.samples();
        if samples.is_empty() {
            return Err(RecognitionError::Unintelligible);
        }

        let wav = wav_bytes(&samples, utterance.sample_rate())
            .map_err(|e| RecognitionError::Provider(e.to_string()))?;
        let part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| RecognitionError::Provider(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "json");

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                RecognitionError::Timeout
            } else {
                RecognitionError::Provider(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(RecognitionError::Provider(format!("HTTP {}: {}", status, body)));
        }

        let json: serde_json::Value = response
            .json()
            .map_err(|e| RecognitionError::Provider(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        debug!("Transcribed {:.2}s of audio: {:?}", utterance.duration().as_secs_f32(), text);
        if text.is_empty() {
            return Err(RecognitionError::Unintelligible);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        let config = RecognitionConfig {
            endpoint: "http://stt.local/v1/".into(),
            ..Default::default()
        };
        let recognizer = HttpRecognizer::new(&config).unwrap();
        assert_eq!(recognizer.url, "http://stt.local/v1/audio/transcriptions");
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: RecognitionConfig =
            serde_json::from_str(r#"{"provider":"whisper","model_path":"/models/base.bin"}"#).unwrap();
        assert_eq!(config.provider, RecognitionProvider::Whisper);
        assert_eq!(config.language, "en");
        assert_eq!(config.timeout(), Duration::from_secs(10));
    }
}
