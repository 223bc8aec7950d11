//! Ollama `/api/generate` backend

use super::backend::{AiBackend, BackendError, BackendParams};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    top_k: usize,
    num_predict: usize,
    num_ctx: usize,
    repeat_penalty: f32,
    repeat_last_n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_thread: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Backend talking to a local Ollama server
pub struct OllamaBackend {
    url: String,
    client: Client,
}

impl OllamaBackend {
    pub fn new(endpoint: &str) -> Result<Self, BackendError> {
        // Per-request timeouts are set on each query
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        info!("Using Ollama at {}", endpoint);
        Ok(Self {
            url: format!("{}/api/generate", endpoint.trim_end_matches('/')),
            client,
        })
    }

    fn body<'a>(prompt: &'a str, params: &'a BackendParams) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &params.model,
            prompt,
            stream: false,
            keep_alive: &params.keep_alive,
            options: GenerateOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                num_predict: params.max_tokens,
                num_ctx: params.context_size,
                repeat_penalty: params.repeat_penalty,
                repeat_last_n: 64,
                num_thread: params.n_threads,
            },
        }
    }
}

impl AiBackend for OllamaBackend {
    fn query(&self, prompt: &str, params: &BackendParams, timeout: Duration) -> Result<String, BackendError> {
        debug!("Querying {} ({} prompt chars)", params.model, prompt.len());

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&Self::body(prompt, params))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(timeout)
                } else {
                    BackendError::Unreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(BackendError::Rejected(format!("HTTP {}: {}", status, body)));
        }

        let reply: GenerateResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(timeout)
            } else {
                BackendError::Malformed(e.to_string())
            }
        })?;

        let text = reply.response.trim().to_string();
        if text.is_empty() {
            return Err(BackendError::EmptyReply);
        }
        Ok(text)
    }
}
