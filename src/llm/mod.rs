//! Conversation layer
//!
//! This module provides:
//! - Bounded dialogue memory and prompt assembly
//! - The [`AiBackend`] seam plus an Ollama HTTP implementation
//! - [`ConversationEngine`], which runs one cancellable turn at a time

pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod ollama;
pub mod prompts;

pub use backend::{AiBackend, BackendError, BackendParams};
pub use config::{LLMConfig, SystemProfile, TuningPreset};
pub use context::{ConversationMemory, Turn};
pub use engine::{ConversationEngine, ConversationError, TurnTicket};
pub use ollama::OllamaBackend;
pub use prompts::{build_prompt, build_system_prompt, SYSTEM_PROMPT};
