use anyhow::{Context, Result};
use clap::Parser;
use parley::audio::WavFileSource;
use parley::llm::TuningPreset;
use parley::{EngineConfig, OrchestratorBuilder, OutboundEvent};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parley - hands-free voice assistant engine
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Replay a WAV file instead of opening the microphone
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Start one capture cycle immediately, without the wake word
    #[arg(long)]
    activate: bool,

    /// Override the wake word
    #[arg(long, env = "PARLEY_WAKE_WORD")]
    wake_word: Option<String>,

    /// Override the backend model
    #[arg(short, long, env = "PARLEY_MODEL")]
    model: Option<String>,

    /// Tune the backend for this host: none, auto, speed or quality
    #[arg(long, env = "PARLEY_PRESET")]
    preset: Option<TuningPreset>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::new(),
    };
    if let Some(wake_word) = cli.wake_word {
        config.wake.wake_word = wake_word;
    }
    if let Some(model) = cli.model {
        config.llm.model = model;
    }
    if let Some(preset) = cli.preset {
        config.llm.preset = preset;
    }

    info!(
        "Starting Parley (wake word '{}', model '{}', preset {})",
        config.wake.wake_word, config.llm.model, config.llm.preset
    );

    let mut builder = OrchestratorBuilder::new(config.clone());
    if let Some(path) = &cli.input {
        // Trailing silence lets the last utterance close before the file ends
        let source = WavFileSource::new(path, config.audio.sample_rate, config.audio.frame_len)
            .with_trailing_silence(config.capture.trailing_silence() + Duration::from_millis(200));
        builder = builder.with_source(source);
    }

    let handle = builder.start().context("starting engine")?;
    let (snapshot, events) = handle.subscribe();
    if cli.json {
        println!("{}", serde_json::to_string(&snapshot)?);
    } else {
        println!("state: {}{}", snapshot.state, if snapshot.muted { " (muted)" } else { "" });
    }

    if cli.activate {
        handle.activate()?;
    }

    for event in events.iter() {
        if cli.json {
            println!("{}", serde_json::to_string(&event)?);
        } else if let Some(line) = describe(&event) {
            println!("{line}");
        }
        if let OutboundEvent::EngineStopped = event {
            break;
        }
    }

    handle.join()?;

    let stats = handle.stats();
    if cli.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!("{}", stats.pipeline.summary());
        for tip in &stats.recommendations {
            println!("tip: {tip}");
        }
    }
    Ok(())
}

/// One human-readable line per event; performance updates are not printed
fn describe(event: &OutboundEvent) -> Option<String> {
    let line = match event {
        OutboundEvent::StateChanged { from, to } => format!("state: {from} -> {to}"),
        OutboundEvent::WakeDetected { trigger } => format!("wake: {trigger:?}"),
        OutboundEvent::UtteranceCaptured { duration_ms, speech_ms } => {
            format!("captured {duration_ms} ms ({speech_ms} ms speech)")
        }
        OutboundEvent::UtteranceDiscarded { reason } => format!("discarded: {reason}"),
        OutboundEvent::RecognitionResult { text } => format!("you: {text}"),
        OutboundEvent::ConversationTurn { turn } => {
            format!("assistant ({} ms): {}", turn.latency_ms, turn.assistant_text)
        }
        OutboundEvent::SpeechStarted { .. } => "speaking...".to_string(),
        OutboundEvent::SpeechEnded { interrupted: true } => "speech interrupted".to_string(),
        OutboundEvent::SpeechEnded { interrupted: false } => "speech finished".to_string(),
        OutboundEvent::PerformanceUpdate(_) => return None,
        OutboundEvent::ErrorOccurred { kind, message } => format!("error ({kind}): {message}"),
        OutboundEvent::MuteChanged { muted } => format!("muted: {muted}"),
        OutboundEvent::EngineStopped => "engine stopped".to_string(),
    };
    Some(line)
}
