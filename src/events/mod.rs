//! Outbound event model
//!
//! Everything a front end can observe about the engine is an
//! [`OutboundEvent`] delivered through the [`EventBus`]. Events are produced
//! by the orchestrator and the performance monitor only.

pub mod bus;

pub use bus::{EventBus, Subscription};

use crate::audio::DiscardReason;
use crate::llm::Turn;
use crate::monitor::PerformanceSample;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline state owned by the orchestrator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Listening,
    Capturing,
    Recognizing,
    Thinking,
    Speaking,
    Interrupted,
}

impl EngineState {
    pub fn is_idle(self) -> bool {
        self == EngineState::Idle
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Listening => "listening",
            EngineState::Capturing => "capturing",
            EngineState::Recognizing => "recognizing",
            EngineState::Thinking => "thinking",
            EngineState::Speaking => "speaking",
            EngineState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// What started a capture cycle
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum WakeTrigger {
    /// The wake word was heard; `evidence` is the window sum that fired
    WakeWord { evidence: f32 },
    /// An `Activate` command
    Manual,
}

/// Pipeline stage an error came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Audio,
    Recognition,
    Backend,
    Synthesis,
    Settings,
    Monitor,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Audio => "audio",
            ErrorKind::Recognition => "recognition",
            ErrorKind::Backend => "backend",
            ErrorKind::Synthesis => "synthesis",
            ErrorKind::Settings => "settings",
            ErrorKind::Monitor => "monitor",
        };
        f.write_str(name)
    }
}

/// Events published to every subscriber, in emission order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    StateChanged { from: EngineState, to: EngineState },
    WakeDetected { trigger: WakeTrigger },
    UtteranceCaptured { duration_ms: u64, speech_ms: u64 },
    /// Capture ended without usable speech (false wake or silence)
    UtteranceDiscarded { reason: DiscardReason },
    RecognitionResult { text: String },
    ConversationTurn { turn: Turn },
    SpeechStarted { text: String },
    SpeechEnded { interrupted: bool },
    PerformanceUpdate(PerformanceSample),
    ErrorOccurred { kind: ErrorKind, message: String },
    MuteChanged { muted: bool },
    /// Last event on every subscription
    EngineStopped,
}

impl OutboundEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        OutboundEvent::ErrorOccurred {
            kind,
            message: message.into(),
        }
    }

    /// Performance updates may be dropped oldest-first by slow subscribers;
    /// nothing else is ever dropped
    pub fn is_performance_update(&self) -> bool {
        matches!(self, OutboundEvent::PerformanceUpdate(_))
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::StateChanged { .. } => "state_changed",
            OutboundEvent::WakeDetected { .. } => "wake_detected",
            OutboundEvent::UtteranceCaptured { .. } => "utterance_captured",
            OutboundEvent::UtteranceDiscarded { .. } => "utterance_discarded",
            OutboundEvent::RecognitionResult { .. } => "recognition_result",
            OutboundEvent::ConversationTurn { .. } => "conversation_turn",
            OutboundEvent::SpeechStarted { .. } => "speech_started",
            OutboundEvent::SpeechEnded { .. } => "speech_ended",
            OutboundEvent::PerformanceUpdate(_) => "performance_update",
            OutboundEvent::ErrorOccurred { .. } => "error_occurred",
            OutboundEvent::MuteChanged { .. } => "mute_changed",
            OutboundEvent::EngineStopped => "engine_stopped",
        }
    }
}

/// Current engine status handed to a new subscriber
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub muted: bool,
    pub latest_sample: Option<PerformanceSample>,
}
