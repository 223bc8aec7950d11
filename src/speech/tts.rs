//! Speech synthesis boundary and the bundled synthesizers
//!
//! A [`Synthesizer`] turns reply text into a [`PlaybackHandle`] and returns
//! immediately; rendering and playback happen on a worker thread. The handle
//! reports completion through a channel (usable in `select!`) and can be
//! stopped at any time, which is how an interrupt silences speech.

use crate::audio::wav::{decode_wav_bytes, to_mono};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while rendering or playing speech
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("voice unavailable: {0}")]
    VoiceUnavailable(String),

    #[error("synthesis failed: {0}")]
    Render(String),

    #[error("synthesis timed out")]
    Timeout,

    #[error("playback failed: {0}")]
    Playback(String),
}

impl From<SynthesisError> for crate::ParleyError {
    fn from(e: SynthesisError) -> Self {
        crate::ParleyError::Synthesis(e.to_string())
    }
}

/// Runtime-adjustable voice parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Voice name understood by the TTS program (e.g. "en-us")
    pub voice: String,

    /// Speaking rate multiplier (1.0 = normal)
    pub rate: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "en".to_string(),
            rate: 1.0,
        }
    }
}

/// Configuration for the external TTS program
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Program to run; it must write a WAV stream to stdout
    pub command: String,

    /// Arguments; `{voice}`, `{rate}` (words per minute) and `{text}` are
    /// substituted. Without a `{text}` argument the text goes to stdin.
    pub args: Vec<String>,

    #[serde(flatten)]
    pub voice: VoiceSettings,

    /// Upper bound for one sentence to render
    pub timeout_ms: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            command: "espeak-ng".to_string(),
            args: ["--stdout", "-v", "{voice}", "-s", "{rate}", "{text}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            voice: VoiceSettings::default(),
            timeout_ms: 10_000,
        }
    }
}

impl SynthesisConfig {
    /// Piper reading text from stdin and writing WAV to stdout
    pub fn piper(model: impl Into<String>) -> Self {
        Self {
            command: "piper".to_string(),
            args: vec![
                "--model".to_string(),
                model.into(),
                "--output_file".to_string(),
                "-".to_string(),
            ],
            ..Default::default()
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice.voice = voice.into();
        self
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.voice.rate = rate;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Rendered mono speech
#[derive(Clone, Debug)]
pub struct SpeechAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SpeechAudio {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Summary delivered when playback of one handle finishes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackReport {
    /// Time spent rendering the audio
    pub rendered_in: Duration,

    /// Audio actually played
    pub played: Duration,

    /// Playback was stopped before the end
    pub stopped: bool,
}

/// Caller's side of one playback
pub struct PlaybackHandle {
    done: Receiver<Result<PlaybackReport, SynthesisError>>,
    stop: Arc<AtomicBool>,
}

/// Worker's side of one playback
pub struct PlaybackControl {
    done: Sender<Result<PlaybackReport, SynthesisError>>,
    stop: Arc<AtomicBool>,
}

impl PlaybackHandle {
    /// Create a connected handle/control pair
    pub fn pair() -> (PlaybackHandle, PlaybackControl) {
        let (done_tx, done_rx) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        (
            PlaybackHandle {
                done: done_rx,
                stop: Arc::clone(&stop),
            },
            PlaybackControl { done: done_tx, stop },
        )
    }

    /// Fires exactly once with the playback outcome
    pub fn done(&self) -> &Receiver<Result<PlaybackReport, SynthesisError>> {
        &self.done
    }

    /// Ask the worker to stop as soon as possible
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Block until playback finishes or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Result<PlaybackReport, SynthesisError> {
        self.done
            .recv_timeout(timeout)
            .map_err(|_| SynthesisError::Timeout)?
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PlaybackControl {
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Report the outcome; consumes the control
    pub fn finish(self, result: Result<PlaybackReport, SynthesisError>) {
        let _ = self.done.try_send(result);
    }
}

/// Renders text into audio
pub trait Voice: Send + Sync {
    fn render(&self, text: &str, settings: &VoiceSettings) -> Result<SpeechAudio, SynthesisError>;
}

/// Plays rendered audio, blocking until done or stopped
pub trait AudioSink: Send + Sync {
    /// Play `audio`; returns how much was played. Must poll
    /// `control.is_stopped()` and return early when it is set.
    fn play(&self, audio: &SpeechAudio, control: &PlaybackControl) -> Result<Duration, SynthesisError>;
}

/// Text-to-playback boundary used by the orchestrator
pub trait Synthesizer: Send + Sync {
    /// Start speaking `text`; returns once playback has been scheduled
    fn synthesize(&self, text: &str) -> Result<PlaybackHandle, SynthesisError>;

    /// Apply new voice settings to subsequent calls
    fn configure(&self, _settings: &VoiceSettings) {}
}

/// Runs a local TTS program (espeak-ng, piper) that emits WAV on stdout
pub struct CommandVoice {
    config: SynthesisConfig,
}

impl CommandVoice {
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    fn args(&self, text: &str, settings: &VoiceSettings) -> (Vec<String>, bool) {
        let wpm = (175.0 * settings.rate.clamp(0.25, 4.0)).round() as u32;
        let mut uses_text = false;
        let args = self
            .config
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{text}") {
                    uses_text = true;
                }
                arg.replace("{voice}", &settings.voice)
                    .replace("{rate}", &wpm.to_string())
                    .replace("{text}", text)
            })
            .collect();
        (args, uses_text)
    }
}

impl Voice for CommandVoice {
    fn render(&self, text: &str, settings: &VoiceSettings) -> Result<SpeechAudio, SynthesisError> {
        let (args, text_in_args) = self.args(text, settings);
        debug!("Running {} for {} chars", self.config.command, text.len());

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(if text_in_args { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SynthesisError::VoiceUnavailable(format!("{}: {}", self.config.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| SynthesisError::Render(format!("Failed to write text: {}", e)))?;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SynthesisError::Render("TTS stdout unavailable".into()))?;
        let reader = thread::spawn(move || {
            let mut bytes = Vec::new();
            stdout.read_to_end(&mut bytes).map(|_| bytes)
        });

        let deadline = Instant::now() + self.config.timeout();
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => break,
                Ok(Some(status)) => {
                    return Err(SynthesisError::Render(format!(
                        "{} exited with {}",
                        self.config.command, status
                    )))
                }
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SynthesisError::Timeout);
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => return Err(SynthesisError::Render(e.to_string())),
            }
        }

        let bytes = reader
            .join()
            .map_err(|_| SynthesisError::Render("TTS reader panicked".into()))?
            .map_err(|e| SynthesisError::Render(format!("Failed to read TTS output: {}", e)))?;
        let (samples, sample_rate, channels) =
            decode_wav_bytes(&bytes).map_err(|e| SynthesisError::Render(e.to_string()))?;

        Ok(SpeechAudio {
            samples: to_mono(&samples, channels),
            sample_rate,
        })
    }
}

/// Headless sink that only waits out the audio duration
#[derive(Clone, Debug)]
pub struct TimedSink {
    speed: f32,
}

impl TimedSink {
    pub fn new() -> Self {
        Self { speed: 1.0 }
    }

    /// Play back faster than real time (tests, dry runs)
    pub fn with_speed(speed: f32) -> Self {
        Self {
            speed: speed.max(0.01),
        }
    }
}

impl Default for TimedSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for TimedSink {
    fn play(&self, audio: &SpeechAudio, control: &PlaybackControl) -> Result<Duration, SynthesisError> {
        let total = audio.duration().div_f32(self.speed);
        let started = Instant::now();
        while started.elapsed() < total {
            if control.is_stopped() {
                return Ok(started.elapsed().mul_f32(self.speed));
            }
            thread::sleep(Duration::from_millis(5).min(total - started.elapsed().min(total)));
        }
        Ok(audio.duration())
    }
}

/// Combines a [`Voice`] and an [`AudioSink`] into a [`Synthesizer`]
pub struct SinkSynthesizer {
    voice: Arc<dyn Voice>,
    sink: Arc<dyn AudioSink>,
    settings: Mutex<VoiceSettings>,
}

impl SinkSynthesizer {
    pub fn new(voice: Arc<dyn Voice>, sink: Arc<dyn AudioSink>, settings: VoiceSettings) -> Self {
        Self {
            voice,
            sink,
            settings: Mutex::new(settings),
        }
    }
}

impl Synthesizer for SinkSynthesizer {
    fn synthesize(&self, text: &str) -> Result<PlaybackHandle, SynthesisError> {
        let (handle, control) = PlaybackHandle::pair();
        let voice = Arc::clone(&self.voice);
        let sink = Arc::clone(&self.sink);
        let settings = self.settings.lock().clone();
        let text = text.to_string();

        thread::Builder::new()
            .name("speech".into())
            .spawn(move || {
                let started = Instant::now();
                let audio = match voice.render(&text, &settings) {
                    Ok(audio) => audio,
                    Err(e) => {
                        warn!("Speech rendering failed: {}", e);
                        control.finish(Err(e));
                        return;
                    }
                };
                let rendered_in = started.elapsed();

                if control.is_stopped() {
                    control.finish(Ok(PlaybackReport {
                        rendered_in,
                        played: Duration::ZERO,
                        stopped: true,
                    }));
                    return;
                }

                let result = sink.play(&audio, &control).map(|played| PlaybackReport {
                    rendered_in,
                    played,
                    stopped: control.is_stopped(),
                });
                control.finish(result);
            })
            .map_err(|e| SynthesisError::Playback(format!("Failed to spawn speech worker: {}", e)))?;

        Ok(handle)
    }

    fn configure(&self, settings: &VoiceSettings) {
        info!("Voice settings updated: {} @ {:.2}x", settings.voice, settings.rate);
        *self.settings.lock() = settings.clone();
    }
}
