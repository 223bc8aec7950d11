//! Utterance capture after wake-word activation
//!
//! The capturer is a two-state machine (Waiting, Capturing). It is purely
//! frame-driven: every duration is measured by summing frame durations, so
//! the same input always yields the same utterance boundaries.

use super::vad::{EnergyDetector, SpeechDetector};
use super::AudioFrame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Silent frames kept ahead of speech onset so recognisers hear the attack
const PRE_ROLL_FRAMES: usize = 3;

/// Capture timing configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// RMS level at or above which a frame counts as speech
    pub speech_threshold: f32,

    /// Silence after speech that ends the utterance
    pub trailing_silence_ms: u64,

    /// Hard cap on capture length, measured from activation
    pub max_utterance_ms: u64,

    /// How long to wait for the first speech frame
    pub onset_timeout_ms: u64,

    /// Minimum amount of speech for a capture to count
    pub min_speech_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.02,
            trailing_silence_ms: 800,
            max_utterance_ms: 6000,
            onset_timeout_ms: 5000,
            min_speech_ms: 90,
        }
    }
}

impl CaptureConfig {
    pub fn trailing_silence(&self) -> Duration {
        Duration::from_millis(self.trailing_silence_ms)
    }

    pub fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }

    pub fn onset_timeout(&self) -> Duration {
        Duration::from_millis(self.onset_timeout_ms)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn with_trailing_silence(mut self, ms: u64) -> Self {
        self.trailing_silence_ms = ms;
        self
    }

    pub fn with_max_utterance(mut self, ms: u64) -> Self {
        self.max_utterance_ms = ms;
        self
    }

    pub fn with_onset_timeout(mut self, ms: u64) -> Self {
        self.onset_timeout_ms = ms;
        self
    }
}

/// Ordered frames of one captured span of speech.
///
/// Always contains at least one speech frame; captures without speech are
/// reported as [`CaptureOutcome::Discarded`] instead.
#[derive(Clone, Debug)]
pub struct Utterance {
    frames: Vec<AudioFrame>,
    speech_frames: usize,
    speech_duration: Duration,
}

impl Utterance {
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<AudioFrame> {
        self.frames
    }

    /// Number of frames classified as speech
    pub fn speech_frames(&self) -> usize {
        self.speech_frames
    }

    pub fn speech_duration(&self) -> Duration {
        self.speech_duration
    }

    pub fn duration(&self) -> Duration {
        self.frames.iter().map(AudioFrame::duration).sum()
    }

    pub fn sample_rate(&self) -> u32 {
        self.frames.first().map(AudioFrame::sample_rate).unwrap_or(16000)
    }

    /// Concatenated samples of every frame
    pub fn samples(&self) -> Vec<f32> {
        let total = self.frames.iter().map(AudioFrame::len).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in &self.frames {
            samples.extend_from_slice(frame.samples());
        }
        samples
    }
}

/// Why a capture produced no utterance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Nothing but silence (false wake or the user said nothing)
    NoSpeech,
    /// Speech shorter than the configured minimum
    TooShort,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::NoSpeech => write!(f, "no speech detected"),
            DiscardReason::TooShort => write!(f, "speech too short"),
        }
    }
}

/// Result of one capture cycle
#[derive(Clone, Debug)]
pub enum CaptureOutcome {
    Utterance(Utterance),
    Discarded(DiscardReason),
}

/// What happened to a frame pushed into the capturer
#[derive(Clone, Debug)]
pub enum CaptureProgress {
    /// Capturer is not active; the frame was ignored
    Waiting,
    /// Capture continues
    Capturing { speech_started: bool },
    /// Capture ended with this frame
    Complete(CaptureOutcome),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapturerState {
    Waiting,
    Capturing,
}

/// Accumulates frames after activation until silence or timeout
pub struct SpeechCapturer {
    config: CaptureConfig,
    detector: Box<dyn SpeechDetector>,
    state: CapturerState,
    frames: Vec<AudioFrame>,
    pre_roll: VecDeque<AudioFrame>,
    speech_started: bool,
    speech_frames: usize,
    speech_duration: Duration,
    elapsed: Duration,
    silence_run: Duration,
}

impl SpeechCapturer {
    /// Create a capturer using the RMS energy detector
    pub fn new(config: CaptureConfig) -> Self {
        let detector = EnergyDetector::new(config.speech_threshold);
        Self::with_detector(config, Box::new(detector))
    }

    /// Create a capturer with a custom speech detector
    pub fn with_detector(config: CaptureConfig, detector: Box<dyn SpeechDetector>) -> Self {
        Self {
            config,
            detector,
            state: CapturerState::Waiting,
            frames: Vec::new(),
            pre_roll: VecDeque::with_capacity(PRE_ROLL_FRAMES),
            speech_started: false,
            speech_frames: 0,
            speech_duration: Duration::ZERO,
            elapsed: Duration::ZERO,
            silence_run: Duration::ZERO,
        }
    }

    pub fn state(&self) -> CapturerState {
        self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Replace the timing configuration; only takes effect between captures
    pub fn set_config(&mut self, config: CaptureConfig) {
        self.config = config;
    }

    /// Waiting -> Capturing. Re-activating an active capture restarts it.
    pub fn activate(&mut self) {
        self.clear();
        self.detector.reset();
        self.state = CapturerState::Capturing;
        debug!("Capture started");
    }

    /// Feed the next frame in arrival order
    pub fn push(&mut self, frame: AudioFrame) -> CaptureProgress {
        if self.state == CapturerState::Waiting {
            return CaptureProgress::Waiting;
        }

        let frame_duration = frame.duration();
        self.elapsed += frame_duration;
        let is_speech = self.detector.is_speech(&frame);

        if is_speech {
            if !self.speech_started {
                self.speech_started = true;
                self.frames.extend(self.pre_roll.drain(..));
            }
            self.speech_frames += 1;
            self.speech_duration += frame_duration;
            self.silence_run = Duration::ZERO;
            self.frames.push(frame);
        } else if self.speech_started {
            self.silence_run += frame_duration;
            self.frames.push(frame);
        } else {
            if self.pre_roll.len() == PRE_ROLL_FRAMES {
                self.pre_roll.pop_front();
            }
            self.pre_roll.push_back(frame);
        }

        let ended = if self.speech_started {
            self.silence_run >= self.config.trailing_silence()
        } else {
            self.elapsed >= self.config.onset_timeout()
        };

        if ended || self.elapsed >= self.config.max_utterance() {
            return CaptureProgress::Complete(self.finish());
        }

        CaptureProgress::Capturing {
            speech_started: self.speech_started,
        }
    }

    /// End the capture now (stream ended, wall-clock guard fired) and hand
    /// the utterance over. The capturer keeps no reference to it.
    pub fn finish(&mut self) -> CaptureOutcome {
        let frames = std::mem::take(&mut self.frames);
        let outcome = if self.speech_frames == 0 {
            CaptureOutcome::Discarded(DiscardReason::NoSpeech)
        } else if self.speech_duration < self.config.min_speech() {
            CaptureOutcome::Discarded(DiscardReason::TooShort)
        } else {
            CaptureOutcome::Utterance(Utterance {
                frames,
                speech_frames: self.speech_frames,
                speech_duration: self.speech_duration,
            })
        };

        debug!(
            "Capture finished after {:?}: {}",
            self.elapsed,
            match &outcome {
                CaptureOutcome::Utterance(u) => format!("{} frames", u.frames.len()),
                CaptureOutcome::Discarded(reason) => reason.to_string(),
            }
        );

        self.clear();
        outcome
    }

    /// Abandon the current capture without producing an outcome
    pub fn cancel(&mut self) {
        if self.state == CapturerState::Capturing {
            debug!("Capture cancelled");
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.state = CapturerState::Waiting;
        self.frames.clear();
        self.pre_roll.clear();
        self.speech_started = false;
        self.speech_frames = 0;
        self.speech_duration = Duration::ZERO;
        self.elapsed = Duration::ZERO;
        self.silence_run = Duration::ZERO;
    }
}
