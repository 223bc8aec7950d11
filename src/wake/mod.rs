//! Wake-word detection
//!
//! A [`KeywordScorer`] turns each frame into a piece of acoustic evidence for
//! the wake phrase. [`WakeWordDetector`] sums that evidence over a sliding
//! window of recent frames and fires once the sum reaches the configured
//! threshold, after which the window is cleared so the same utterance cannot
//! trigger twice.

pub mod template;

pub use template::TemplateScorer;

use crate::audio::AudioFrame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WakeError {
    #[error("wake-word model failed to initialise: {0}")]
    ModelInit(String),

    #[error("invalid wake-word configuration: {0}")]
    Config(String),
}

impl From<WakeError> for crate::ParleyError {
    fn from(e: WakeError) -> Self {
        match e {
            WakeError::ModelInit(msg) => crate::ParleyError::ModelLoad(msg),
            WakeError::Config(msg) => crate::ParleyError::Config(msg),
        }
    }
}

/// Wake-word configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Trigger phrase, used for logging and front-end display
    pub wake_word: String,

    /// Enrolment recording of the wake phrase. Without one a plain energy
    /// heuristic stands in.
    pub model_path: Option<PathBuf>,

    /// Evidence sum needed within the window
    pub threshold: f32,

    /// Number of recent frames whose evidence is summed
    pub window_frames: usize,

    /// Quiet period after a detection during which nothing fires
    pub refractory_ms: u64,

    /// Keep listening for the wake word while speaking and interrupt on a hit
    pub barge_in: bool,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            wake_word: "jarvis".to_string(),
            model_path: None,
            threshold: 4.0,
            window_frames: 12,
            refractory_ms: 1200,
            barge_in: true,
        }
    }
}

impl WakeConfig {
    pub fn with_wake_word(mut self, wake_word: impl Into<String>) -> Self {
        self.wake_word = wake_word.into();
        self
    }

    pub fn with_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_window(mut self, frames: usize) -> Self {
        self.window_frames = frames;
        self
    }

    pub fn with_refractory(mut self, ms: u64) -> Self {
        self.refractory_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), WakeError> {
        if self.threshold.is_nan() || self.threshold <= 0.0 {
            return Err(WakeError::Config("threshold must be positive".into()));
        }
        if self.window_frames == 0 {
            return Err(WakeError::Config("window_frames must be at least 1".into()));
        }
        Ok(())
    }
}

/// Per-frame acoustic evidence for the wake phrase.
///
/// Scores are non-negative; larger means more likely. Frames arrive in
/// strict stream order.
pub trait KeywordScorer: Send {
    fn score(&mut self, frame: &AudioFrame) -> f32;

    /// Forget any accumulated context (called after a detection)
    fn reset(&mut self) {}
}

/// Scorer for a config: the enrolment template when `model_path` is set,
/// otherwise the energy heuristic
pub fn scorer_for(
    config: &WakeConfig,
    frame_len: usize,
    sample_rate: u32,
) -> Result<Box<dyn KeywordScorer>, WakeError> {
    match &config.model_path {
        Some(path) => {
            let scorer = TemplateScorer::from_wav(path, frame_len, sample_rate)?;
            info!("Wake word '{}' loaded from {:?}", config.wake_word, path);
            Ok(Box::new(scorer))
        }
        None => {
            warn!(
                "No wake-word recording for '{}'; falling back to the energy heuristic",
                config.wake_word
            );
            Ok(Box::new(EnergyScorer::default()))
        }
    }
}

/// Loudness heuristic used when no enrolment recording is configured.
///
/// Every frame louder than `level` contributes evidence in proportion to its
/// RMS, so any sustained sound activates the engine.
#[derive(Debug, Clone)]
pub struct EnergyScorer {
    level: f32,
}

impl EnergyScorer {
    pub fn new(level: f32) -> Self {
        Self {
            level: level.max(1e-6),
        }
    }
}

impl Default for EnergyScorer {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl KeywordScorer for EnergyScorer {
    fn score(&mut self, frame: &AudioFrame) -> f32 {
        let rms = frame.rms();
        if rms < self.level {
            0.0
        } else {
            (rms / self.level / 2.0).min(1.0)
        }
    }
}

pub struct WakeWordDetector {
    scorer: Box<dyn KeywordScorer>,
    window: VecDeque<f32>,
    window_frames: usize,
    threshold: f32,
    refractory: Duration,
    cooldown: Duration,
    evidence: f32,
    last_detection: Option<f32>,
}

impl WakeWordDetector {
    pub fn new(config: &WakeConfig, scorer: Box<dyn KeywordScorer>) -> Result<Self, WakeError> {
        config.validate()?;
        Ok(Self {
            scorer,
            window: VecDeque::with_capacity(config.window_frames),
            window_frames: config.window_frames,
            threshold: config.threshold,
            refractory: Duration::from_millis(config.refractory_ms),
            cooldown: Duration::ZERO,
            evidence: 0.0,
            last_detection: None,
        })
    }

    /// Build the detector a config describes, loading the enrolment
    /// recording if one is set. Fails here rather than per frame.
    pub fn from_config(config: &WakeConfig, frame_len: usize, sample_rate: u32) -> Result<Self, WakeError> {
        Self::new(config, scorer_for(config, frame_len, sample_rate)?)
    }

    /// Feed the next frame; true when the wake phrase was detected
    pub fn feed(&mut self, frame: &AudioFrame) -> bool {
        let score = self.scorer.score(frame).max(0.0);

        if !self.cooldown.is_zero() {
            self.cooldown = self.cooldown.saturating_sub(frame.duration());
            return false;
        }

        if self.window.len() == self.window_frames {
            self.window.pop_front();
        }
        self.window.push_back(score);
        self.evidence = self.window.iter().sum();

        if self.evidence >= self.threshold {
            debug!("Wake evidence {:.3} >= {:.3}", self.evidence, self.threshold);
            self.last_detection = Some(self.evidence);
            self.clear();
            self.cooldown = self.refractory;
            return true;
        }
        false
    }

    /// Evidence currently held in the window
    pub fn evidence(&self) -> f32 {
        self.evidence
    }

    /// Evidence sum of the most recent detection
    pub fn last_detection(&self) -> Option<f32> {
        self.last_detection
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Drop all evidence and any pending refractory period
    pub fn reset(&mut self) {
        self.clear();
        self.cooldown = Duration::ZERO;
    }

    fn clear(&mut self) {
        self.window.clear();
        self.evidence = 0.0;
        self.scorer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Replays a fixed list of scores, then zeros
    struct Scripted {
        scores: VecDeque<f32>,
    }

    impl KeywordScorer for Scripted {
        fn score(&mut self, _frame: &AudioFrame) -> f32 {
            self.scores.pop_front().unwrap_or(0.0)
        }
    }

    fn detector(scores: Vec<f32>, threshold: f32, window: usize) -> WakeWordDetector {
        let config = WakeConfig::default()
            .with_threshold(threshold)
            .with_window(window)
            .with_refractory(0);
        WakeWordDetector::new(&config, Box::new(Scripted { scores: scores.into() })).unwrap()
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0.0; 160], 16000, Duration::ZERO)
    }

    #[test]
    fn test_fires_when_window_reaches_threshold() {
        let mut d = detector(vec![0.5, 0.5, 0.5, 0.5], 2.0, 4);
        assert!(!d.feed(&frame()));
        assert!(!d.feed(&frame()));
        assert!(!d.feed(&frame()));
        assert!(d.feed(&frame()));
        assert_eq!(d.evidence(), 0.0);
        assert_eq!(d.last_detection(), Some(2.0));
    }

    #[test]
    fn test_evidence_outside_window_is_forgotten() {
        let mut d = detector(vec![1.0, 0.0, 0.0, 1.0], 2.0, 3);
        for _ in 0..4 {
            assert!(!d.feed(&frame()));
        }
    }

    #[test]
    fn test_refractory_suppresses_retrigger() {
        let config = WakeConfig::default()
            .with_threshold(1.0)
            .with_window(1)
            .with_refractory(20);
        let scorer = Scripted {
            scores: vec![1.0, 1.0, 1.0, 1.0].into(),
        };
        let mut d = WakeWordDetector::new(&config, Box::new(scorer)).unwrap();

        // 10ms frames: one hit, two frames of cooldown, then armed again
        assert!(d.feed(&frame()));
        assert!(!d.feed(&frame()));
        assert!(!d.feed(&frame()));
        assert!(d.feed(&frame()));
    }

    #[test]
    fn test_invalid_config_fails_at_construction() {
        let config = WakeConfig::default().with_window(0);
        assert!(WakeWordDetector::new(&config, Box::new(EnergyScorer::default())).is_err());
        let config = WakeConfig::default().with_threshold(0.0);
        assert!(WakeWordDetector::new(&config, Box::new(EnergyScorer::default())).is_err());
    }

    #[test]
    fn test_missing_model_fails_fast() {
        let config = WakeConfig::default().with_model("/nonexistent/wake.wav");
        assert!(matches!(
            WakeWordDetector::from_config(&config, 512, 16000),
            Err(WakeError::ModelInit(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_sub_threshold_evidence_never_fires(
            window in 1usize..16,
            fractions in prop::collection::vec(0.0f32..0.999, 1..200),
        ) {
            let threshold = 3.0;
            // Each score is below threshold / window, so no window can sum to it
            let per_frame = threshold / window as f32;
            let scores: Vec<f32> = fractions.iter().map(|f| f * per_frame).collect();
            let mut d = detector(scores.clone(), threshold, window);
            for _ in 0..scores.len() {
                prop_assert!(!d.feed(&frame()));
            }
        }

        #[test]
        fn prop_fires_iff_window_sum_crosses(
            window in 1usize..8,
            scores in prop::collection::vec(0.0f32..1.0, 1..120),
        ) {
            let threshold = 2.5;
            let mut d = detector(scores.clone(), threshold, window);
            let mut model: VecDeque<f32> = VecDeque::new();
            for &score in &scores {
                if model.len() == window {
                    model.pop_front();
                }
                model.push_back(score);
                let expected = model.iter().sum::<f32>() >= threshold;
                if expected {
                    model.clear();
                }
                prop_assert_eq!(d.feed(&frame()), expected);
            }
        }
    }
}
