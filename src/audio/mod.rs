//! Audio frame model and the frame source boundary
//!
//! Everything upstream of the wake-word detector speaks in fixed-size mono
//! PCM frames. Device drivers are kept behind [`AudioFrameSource`].

pub mod buffer;
pub mod capture;
#[cfg(feature = "audio-io")]
pub mod input;
#[cfg(feature = "audio-io")]
pub mod output;
pub mod resampler;
pub mod vad;
pub mod wav;

pub use buffer::{FrameBuffer, FrameReader, FrameWriter};
pub use capture::{
    CaptureConfig, CaptureOutcome, CaptureProgress, CapturerState, DiscardReason, SpeechCapturer, Utterance,
};
#[cfg(feature = "audio-io")]
pub use input::MicrophoneSource;
#[cfg(feature = "audio-io")]
pub use output::SpeakerSink;
pub use resampler::AudioResampler;
pub use vad::{EnergyDetector, SpeechDetector};
pub use wav::{read_wav, write_wav, WavFileSource};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by frame sources and sinks
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error("audio format error: {0}")]
    Format(String),
}

impl From<AudioError> for crate::ParleyError {
    fn from(e: AudioError) -> Self {
        crate::ParleyError::AudioDevice(e.to_string())
    }
}

/// Audio settings shared by sources and the capture pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Engine sample rate; sources resample to this
    pub sample_rate: u32,

    /// Samples per frame (512 @ 16kHz = 32ms)
    pub frame_len: usize,

    /// Frames held between the source and the engine before the oldest drop
    pub buffer_frames: usize,

    /// Input device name (None = system default)
    pub input_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_len: 512,
            buffer_frames: 64,
            input_device: None,
        }
    }
}

impl AudioConfig {
    /// Duration of one frame at the configured rate
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_len as f64 / self.sample_rate.max(1) as f64)
    }
}

/// One fixed-size block of mono PCM samples. Immutable once produced.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
    timestamp: Duration,
}

impl AudioFrame {
    /// Create a frame; `timestamp` is the stream position of its first sample
    pub fn new(samples: Vec<f32>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            timestamp,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wall duration covered by this frame
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }

    /// Root-mean-square level of the frame
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Root-mean-square level of a sample block
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// A producer of audio frames (microphone, file, test script).
///
/// `start` must fail immediately if the device cannot be opened; once started
/// the source pushes frames into the writer without ever blocking on the
/// consumer, and closes the writer when the stream ends.
pub trait AudioFrameSource: Send {
    /// Begin delivering frames
    fn start(&mut self, writer: FrameWriter) -> std::result::Result<(), AudioError>;

    /// Stop delivering frames and release the device
    fn stop(&mut self);

    /// Sample rate of the frames this source produces
    fn sample_rate(&self) -> u32;
}

/// Cuts an arbitrary chunked sample stream into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    emitted: u64,
}

impl FrameAssembler {
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        Self {
            frame_len: frame_len.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_len * 2),
            emitted: 0,
        }
    }

    /// Append samples and return every complete frame
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let block = std::mem::replace(&mut self.pending, rest);
            frames.push(self.make_frame(block));
        }
        frames
    }

    /// Emit the trailing partial frame, zero-padded
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut block = std::mem::take(&mut self.pending);
        block.resize(self.frame_len, 0.0);
        Some(self.make_frame(block))
    }

    fn make_frame(&mut self, block: Vec<f32>) -> AudioFrame {
        let position = self.emitted * self.frame_len as u64;
        let timestamp = Duration::from_secs_f64(position as f64 / self.sample_rate.max(1) as f64);
        self.emitted += 1;
        AudioFrame::new(block, self.sample_rate, timestamp)
    }
}
