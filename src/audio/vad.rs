//! Speech/silence classification for captured frames

use super::AudioFrame;

/// Decides whether a frame carries speech energy
pub trait SpeechDetector: Send {
    /// Classify one frame
    fn is_speech(&mut self, frame: &AudioFrame) -> bool;

    /// Clear any internal state between captures
    fn reset(&mut self) {}
}

/// RMS threshold detector; deterministic and model-free
#[derive(Clone, Debug)]
pub struct EnergyDetector {
    threshold: f32,
}

impl EnergyDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.max(0.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Set the RMS level at or above which a frame counts as speech
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold.max(0.0);
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new(0.02)
    }
}

impl SpeechDetector for EnergyDetector {
    fn is_speech(&mut self, frame: &AudioFrame) -> bool {
        frame.rms() >= self.threshold
    }
}

#[cfg(feature = "silero-vad")]
pub use silero::SileroDetector;

#[cfg(feature = "silero-vad")]
mod silero {
    use super::SpeechDetector;
    use crate::audio::AudioFrame;
    use crate::{ParleyError, Result};
    use tracing::info;
    use voice_activity_detector::VoiceActivityDetector as VadDetector;

    /// Voice activity detection using Silero VAD
    pub struct SileroDetector {
        detector: VadDetector,
        threshold: f32,
    }

    impl SileroDetector {
        /// Create a new VAD instance
        ///
        /// # Arguments
        /// * `sample_rate` - Sample rate of the audio (8000 or 16000)
        /// * `threshold` - Probability threshold for speech detection (0.0-1.0)
        pub fn new(sample_rate: u32, threshold: f32) -> Result<Self> {
            if ![8000, 16000].contains(&sample_rate) {
                return Err(ParleyError::Config(format!(
                    "Invalid sample rate: {}. Must be 8000 or 16000",
                    sample_rate
                )));
            }

            let chunk_size: usize = if sample_rate == 8000 { 256 } else { 512 };

            let detector = VadDetector::builder()
                .sample_rate(sample_rate as i32)
                .chunk_size(chunk_size)
                .build()
                .map_err(|e| ParleyError::ModelLoad(format!("Failed to create VAD: {:?}", e)))?;

            info!("Initialized Silero VAD with sample rate: {}, threshold: {}", sample_rate, threshold);

            Ok(Self {
                detector,
                threshold: threshold.clamp(0.0, 1.0),
            })
        }
    }

    impl SpeechDetector for SileroDetector {
        fn is_speech(&mut self, frame: &AudioFrame) -> bool {
            let probability = self.detector.predict(frame.samples().iter().copied());
            probability >= self.threshold
        }

        fn reset(&mut self) {
            self.detector.reset();
        }
    }
}
