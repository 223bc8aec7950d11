use super::config::LLMConfig;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by an [`AiBackend`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend rejected the request: {0}")]
    Rejected(String),

    #[error("malformed backend reply: {0}")]
    Malformed(String),

    #[error("backend returned an empty reply")]
    EmptyReply,
}

/// Sampling parameters forwarded with each query
#[derive(Clone, Debug, PartialEq)]
pub struct BackendParams {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub max_tokens: usize,
    pub repeat_penalty: f32,
    pub context_size: usize,
    pub n_threads: Option<usize>,
    pub keep_alive: String,
}

impl From<&LLMConfig> for BackendParams {
    fn from(config: &LLMConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_tokens: config.max_tokens,
            repeat_penalty: config.repeat_penalty,
            context_size: config.context_size,
            n_threads: config.n_threads,
            keep_alive: config.keep_alive.clone(),
        }
    }
}

/// Text-generation service answering one prompt at a time.
///
/// `query` blocks; it should give up on its own once `timeout` elapses, but
/// callers do not rely on that and enforce the deadline themselves.
pub trait AiBackend: Send + Sync {
    fn query(&self, prompt: &str, params: &BackendParams, timeout: Duration) -> Result<String, BackendError>;
}
