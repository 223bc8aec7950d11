//! Integration layer
//!
//! Wires the components into one running engine:
//! - [`EngineConfig`] and the runtime-updatable [`EngineSettings`]
//! - [`Orchestrator`], the state machine, started through [`OrchestratorBuilder`]
//! - [`EngineHandle`], the command and event boundary for front ends

pub mod config;
pub mod orchestrator;

pub use config::{CueConfig, EngineConfig, EngineSettings, EventConfig, ShutdownPhrases};
pub use orchestrator::{EngineCommand, EngineHandle, EngineStats, Orchestrator, OrchestratorBuilder, ScorerFactory};
