use super::{KeywordScorer, WakeError};
use crate::audio::resampler::resample_audio;
use crate::audio::wav::{read_wav, to_mono};
use crate::audio::{rms, AudioFrame, FrameAssembler};
use std::collections::VecDeque;
use std::path::Path;
use tracing::debug;

/// Features extracted per frame
const FEATURES: usize = 6;
/// Sub-blocks per frame for the energy contour
const SUB_BLOCKS: usize = 4;
/// RMS below which a window is treated as silence
const SILENCE_RMS: f32 = 0.005;
/// Correlation at or below which a window earns no evidence
const MIN_CORRELATION: f32 = 0.5;

type Features = [f32; FEATURES];

fn features(samples: &[f32]) -> Features {
    let level = rms(samples);
    let log_energy = ((level + 1e-4).ln() + 9.2) / 9.2;

    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    let zcr = crossings as f32 / samples.len().max(1) as f32;

    let mut out = [0.0; FEATURES];
    out[0] = log_energy;
    out[1] = zcr;
    let block = (samples.len() / SUB_BLOCKS).max(1);
    for (i, chunk) in samples.chunks(block).take(SUB_BLOCKS).enumerate() {
        out[2 + i] = rms(chunk) / (level + 1e-6);
    }
    out
}

/// Subtract the per-feature mean over the sequence
fn centered(seq: impl Iterator<Item = Features> + Clone, len: usize) -> Vec<f32> {
    let mut mean = [0.0f32; FEATURES];
    for f in seq.clone() {
        for (m, v) in mean.iter_mut().zip(f) {
            *m += v;
        }
    }
    for m in mean.iter_mut() {
        *m /= len.max(1) as f32;
    }
    seq.flat_map(|f| {
        let mut c = f;
        for (v, m) in c.iter_mut().zip(mean) {
            *v -= m;
        }
        c
    })
    .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na < 1e-9 || nb < 1e-9 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Matches the incoming stream against an enrolment recording of the wake
/// phrase.
///
/// Each frame is reduced to a small feature vector (log energy, zero-crossing
/// rate, energy contour). The most recent frames, as many as the template
/// has, are correlated with the template; correlation above 0.5 is scaled to
/// evidence in `0.0..=1.0`.
pub struct TemplateScorer {
    template: Vec<f32>,
    frames: usize,
    history: VecDeque<Features>,
    levels: VecDeque<f32>,
}

impl TemplateScorer {
    /// Load the enrolment WAV and frame it the way the engine frames audio
    pub fn from_wav(path: impl AsRef<Path>, frame_len: usize, sample_rate: u32) -> Result<Self, WakeError> {
        let path = path.as_ref();
        let (samples, rate, channels) = read_wav(path)
            .map_err(|e| WakeError::ModelInit(format!("{:?}: {}", path, e)))?;
        let mono = to_mono(&samples, channels);
        let samples = resample_audio(&mono, rate, sample_rate)
            .map_err(|e| WakeError::ModelInit(e.to_string()))?;
        Self::from_samples(&samples, frame_len, sample_rate)
    }

    pub fn from_samples(samples: &[f32], frame_len: usize, sample_rate: u32) -> Result<Self, WakeError> {
        let mut assembler = FrameAssembler::new(frame_len, sample_rate);
        let mut frames = assembler.push(samples);
        frames.extend(assembler.flush());

        if frames.len() < 2 {
            return Err(WakeError::ModelInit(format!(
                "enrolment recording too short: {} frame(s)",
                frames.len()
            )));
        }
        if rms(samples) < SILENCE_RMS {
            return Err(WakeError::ModelInit("enrolment recording is silent".into()));
        }

        let feats: Vec<Features> = frames.iter().map(|f| features(f.samples())).collect();
        let template = centered(feats.iter().copied(), feats.len());
        debug!("Wake template: {} frames", feats.len());

        Ok(Self {
            template,
            frames: feats.len(),
            history: VecDeque::with_capacity(feats.len()),
            levels: VecDeque::with_capacity(feats.len()),
        })
    }

    /// Length of the template in frames
    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl KeywordScorer for TemplateScorer {
    fn score(&mut self, frame: &AudioFrame) -> f32 {
        if self.history.len() == self.frames {
            self.history.pop_front();
            self.levels.pop_front();
        }
        self.history.push_back(features(frame.samples()));
        self.levels.push_back(frame.rms());

        if self.history.len() < self.frames {
            return 0.0;
        }
        let mean_level = self.levels.iter().sum::<f32>() / self.levels.len() as f32;
        if mean_level < SILENCE_RMS {
            return 0.0;
        }

        let window = centered(self.history.iter().copied(), self.frames);
        let correlation = cosine(&window, &self.template);
        ((correlation - MIN_CORRELATION) / (1.0 - MIN_CORRELATION)).clamp(0.0, 1.0)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.levels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::write_wav;
    use crate::wake::{WakeConfig, WakeWordDetector};
    use tempfile::tempdir;

    /// Three bursts of rising pitch with gaps, loosely like "ja-ar-vis"
    fn phrase() -> Vec<f32> {
        let mut samples = Vec::new();
        for (i, freq) in [300.0f32, 600.0, 2400.0].iter().enumerate() {
            let amp = 0.2 + 0.15 * i as f32;
            samples.extend((0..2400).map(|n| (n as f32 * freq * std::f32::consts::TAU / 16000.0).sin() * amp));
            samples.extend(std::iter::repeat(0.0).take(800));
        }
        samples
    }

    fn frames_of(samples: &[f32]) -> Vec<AudioFrame> {
        let mut assembler = FrameAssembler::new(320, 16000);
        let mut frames = assembler.push(samples);
        frames.extend(assembler.flush());
        frames
    }

    #[test]
    fn test_template_matches_itself() {
        let mut scorer = TemplateScorer::from_samples(&phrase(), 320, 16000).unwrap();
        let scores: Vec<f32> = frames_of(&phrase()).iter().map(|f| scorer.score(f)).collect();
        let last = *scores.last().unwrap();
        assert!(last > 0.99, "aligned score was {}", last);
    }

    #[test]
    fn test_silence_scores_zero() {
        let mut scorer = TemplateScorer::from_samples(&phrase(), 320, 16000).unwrap();
        for frame in frames_of(&vec![0.0; 16000]) {
            assert_eq!(scorer.score(&frame), 0.0);
        }
    }

    #[test]
    fn test_detector_fires_on_enrolled_phrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jarvis.wav");
        write_wav(&path, &phrase(), 16000, 1).unwrap();

        let config = WakeConfig::default()
            .with_model(&path)
            .with_threshold(0.9)
            .with_window(3);
        let mut detector = WakeWordDetector::from_config(&config, 320, 16000).unwrap();

        let mut stream = vec![0.0; 8000];
        stream.extend(phrase());
        let fired = frames_of(&stream).iter().any(|f| detector.feed(f));
        assert!(fired);
    }

    #[test]
    fn test_short_or_silent_enrolment_is_rejected() {
        assert!(TemplateScorer::from_samples(&[0.3; 100], 320, 16000).is_err());
        assert!(TemplateScorer::from_samples(&vec![0.0; 16000], 320, 16000).is_err());
    }
}
