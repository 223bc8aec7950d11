//! Configuration for the whole engine
//!
//! One serde document with a section per component. Every section falls back
//! to its defaults, so a config file only needs the values it changes.

use crate::audio::{AudioConfig, CaptureConfig};
use crate::events::bus::DEFAULT_PERFORMANCE_BACKLOG;
use crate::llm::LLMConfig;
use crate::monitor::MonitorConfig;
use crate::speech::{RecognitionConfig, SynthesisConfig, VoiceSettings};
use crate::wake::WakeConfig;
use crate::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Outbound event delivery settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Unread performance updates kept per subscriber before the oldest drop
    pub performance_backlog: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            performance_backlog: DEFAULT_PERFORMANCE_BACKLOG,
        }
    }
}

/// Short phrases spoken outside of replies. `None` keeps the engine silent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CueConfig {
    /// Spoken after activation, before the capture starts
    pub acknowledgement: Option<String>,

    /// Spoken when a shutdown phrase or command stops the engine
    pub farewell: Option<String>,

    /// Spoken when the backend gives no usable reply
    pub fallback: Option<String>,
}

impl Default for CueConfig {
    fn default() -> Self {
        Self {
            acknowledgement: Some("Yes sir?".to_string()),
            farewell: Some("Shutting down systems.".to_string()),
            fallback: Some("I'm having trouble thinking right now.".to_string()),
        }
    }
}

impl CueConfig {
    /// No cues at all
    pub fn silent() -> Self {
        Self {
            acknowledgement: None,
            farewell: None,
            fallback: None,
        }
    }
}

/// Configuration for the complete engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub wake: WakeConfig,
    pub capture: CaptureConfig,
    pub recognition: RecognitionConfig,
    pub llm: LLMConfig,
    pub synthesis: SynthesisConfig,
    pub monitor: MonitorConfig,
    pub events: EventConfig,
    pub cues: CueConfig,

    /// Spoken phrases that stop the engine instead of reaching the backend
    pub shutdown_phrases: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            wake: WakeConfig::default(),
            capture: CaptureConfig::default(),
            recognition: RecognitionConfig::default(),
            llm: LLMConfig::default(),
            synthesis: SynthesisConfig::default(),
            monitor: MonitorConfig::default(),
            events: EventConfig::default(),
            cues: CueConfig::default(),
            shutdown_phrases: vec!["exit".to_string(), "quit".to_string(), "shutdown".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ParleyError::Config(format!("cannot read {:?}: {}", path, e)))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| ParleyError::Config(format!("invalid config {:?}: {}", path, e)))?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ParleyError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn with_wake(mut self, wake: WakeConfig) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_llm(mut self, llm: LLMConfig) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_cues(mut self, cues: CueConfig) -> Self {
        self.cues = cues;
        self
    }

    pub fn with_shutdown_phrases<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shutdown_phrases = phrases.into_iter().map(Into::into).collect();
        self
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(config_error("audio.sample_rate must be positive"));
        }
        if self.audio.frame_len == 0 {
            return Err(config_error("audio.frame_len must be positive"));
        }
        if self.audio.buffer_frames == 0 {
            return Err(config_error("audio.buffer_frames must be positive"));
        }
        if self.recognition.timeout_ms == 0 {
            return Err(config_error("recognition.timeout_ms must be positive"));
        }
        if self.synthesis.timeout_ms == 0 {
            return Err(config_error("synthesis.timeout_ms must be positive"));
        }
        if self.monitor.interval_ms == 0 {
            return Err(config_error("monitor.interval_ms must be positive"));
        }
        if self.events.performance_backlog == 0 {
            return Err(config_error("events.performance_backlog must be positive"));
        }
        self.settings().validate()
    }

    /// The runtime-adjustable part of this config
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            wake: self.wake.clone(),
            capture: self.capture.clone(),
            llm: self.llm.clone(),
            voice: self.synthesis.voice.clone(),
        }
    }

    pub fn apply_settings(&mut self, settings: EngineSettings) {
        self.wake = settings.wake;
        self.capture = settings.capture;
        self.llm = settings.llm;
        self.synthesis.voice = settings.voice;
    }

    /// Normalised shutdown phrases
    pub fn shutdown_matcher(&self) -> ShutdownPhrases {
        ShutdownPhrases::new(&self.shutdown_phrases)
    }
}

/// Settings carried by `UpdateSettings`; applied only between turns
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub wake: WakeConfig,
    pub capture: CaptureConfig,
    pub llm: LLMConfig,
    pub voice: VoiceSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineConfig::new().settings()
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        self.wake.validate()?;
        if self.capture.trailing_silence_ms == 0 || self.capture.max_utterance_ms == 0 {
            return Err(config_error("capture durations must be positive"));
        }
        if self.capture.speech_threshold.is_nan() || self.capture.speech_threshold <= 0.0 {
            return Err(config_error("capture.speech_threshold must be positive"));
        }
        if self.llm.timeout_ms == 0 {
            return Err(config_error("llm.timeout_ms must be positive"));
        }
        if self.llm.max_tokens == 0 {
            return Err(config_error("llm.max_tokens must be positive"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(config_error("llm.temperature must be within 0.0..=2.0"));
        }
        if self.voice.rate.is_nan() || self.voice.rate <= 0.0 {
            return Err(config_error("voice rate must be positive"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> ParleyError {
    ParleyError::Config(message.to_string())
}

/// Matches recognised text against shutdown phrases, ignoring case and
/// punctuation
#[derive(Clone, Debug, Default)]
pub struct ShutdownPhrases {
    phrases: Vec<String>,
}

impl ShutdownPhrases {
    pub fn new<S: AsRef<str>>(phrases: &[S]) -> Self {
        Self {
            phrases: phrases
                .iter()
                .map(|p| normalize(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let text = normalize(text);
        !text.is_empty() && self.phrases.iter().any(|p| *p == text)
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
