pub mod audio;
pub mod events;
pub mod integration;
pub mod llm;
pub mod monitor;
pub mod speech;
pub mod utils;
pub mod wake;

use thiserror::Error;

pub use events::{EngineSnapshot, EngineState, ErrorKind, EventBus, OutboundEvent, Subscription, WakeTrigger};
pub use integration::{
    CueConfig, EngineCommand, EngineConfig, EngineHandle, EngineSettings, EngineStats, Orchestrator,
    OrchestratorBuilder,
};

#[derive(Error, Debug, Clone)]
pub enum ParleyError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("Conversation error: {0}")]
    Conversation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),
}

impl From<std::io::Error> for ParleyError {
    fn from(e: std::io::Error) -> Self {
        ParleyError::Io(e.to_string())
    }
}

impl ParleyError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Hardware/device errors need user intervention
            ParleyError::AudioDevice(_) => false,
            ParleyError::ModelLoad(_) => false,
            // Per-turn failures; the user retries with the wake word
            ParleyError::Recognition(_) => true,
            ParleyError::Conversation(_) => true,
            ParleyError::Synthesis(_) => true,
            ParleyError::Io(_) => false,
            ParleyError::Config(_) => false,
            ParleyError::Channel(_) => false,
            ParleyError::Monitor(_) => true,
            ParleyError::Orchestrator(_) => true,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::AudioDevice(_) => {
                "Audio device error. Please check your microphone/speakers.".to_string()
            }
            ParleyError::ModelLoad(_) => {
                "Failed to load a speech model. Please verify model files are present.".to_string()
            }
            ParleyError::Recognition(_) => {
                "Speech recognition failed. Please try again.".to_string()
            }
            ParleyError::Conversation(_) => {
                "The assistant could not answer. Please try again.".to_string()
            }
            ParleyError::Synthesis(_) => {
                "Text-to-speech failed. Response will be shown as text.".to_string()
            }
            ParleyError::Io(_) => "File system error occurred.".to_string(),
            ParleyError::Config(_) => "Configuration error. Please check settings.".to_string(),
            ParleyError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            ParleyError::Monitor(_) => "System metrics are unavailable.".to_string(),
            ParleyError::Orchestrator(_) => "System error occurred. Please try again.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
