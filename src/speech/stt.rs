//! Local speech-to-text with whisper.cpp

use super::recognizer::{RecognitionConfig, RecognitionError, Recognizer};
use crate::audio::resampler::resample_audio;
use crate::audio::Utterance;
use crate::{ParleyError, Result};
use std::path::Path;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Whisper expects 16 kHz mono input
const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Recognizer running a ggml Whisper model in-process
pub struct WhisperRecognizer {
    context: WhisperContext,
    language: String,
    n_threads: i32,
}

impl WhisperRecognizer {
    /// Load the model named by `config.model_path`; fails if it is missing
    pub fn new(config: &RecognitionConfig) -> Result<Self> {
        let path = config
            .model_path
            .as_deref()
            .ok_or_else(|| ParleyError::Config("recognition.model_path is required for whisper".into()))?;
        Self::load(path, &config.language)
    }

    pub fn load(model_path: &Path, language: &str) -> Result<Self> {
        if !model_path.exists() {
            return Err(ParleyError::ModelLoad(format!("Model file not found: {:?}", model_path)));
        }

        info!("Loading Whisper model from {:?}", model_path);

        let context = WhisperContext::new_with_params(
            model_path
                .to_str()
                .ok_or_else(|| ParleyError::ModelLoad("Invalid model path".to_string()))?,
            WhisperContextParameters::default(),
        )
        .map_err(|e| ParleyError::ModelLoad(format!("Failed to load Whisper model: {:?}", e)))?;

        let n_threads = std::thread::available_parallelism()
            .map(|n| n.get().min(8) as i32)
            .unwrap_or(4);

        info!("Whisper model loaded successfully");

        Ok(Self {
            context,
            language: language.to_string(),
            n_threads,
        })
    }
}

impl Recognizer for WhisperRecognizer {
    fn recognize(&self, utterance: Utterance) -> std::result::Result<String, RecognitionError> {
        let rate = utterance.sample_rate();
        let samples = resample_audio(&utterance.samples(), rate, WHISPER_SAMPLE_RATE)
            .map_err(|e| RecognitionError::Provider(e.to_string()))?;
        if samples.is_empty() {
            return Err(RecognitionError::Unintelligible);
        }

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(self.n_threads);
        params.set_translate(false);
        params.set_print_timestamps(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_language(Some(&self.language));

        let mut state = self
            .context
            .create_state()
            .map_err(|e| RecognitionError::Provider(format!("Failed to create state: {:?}", e)))?;

        state
            .full(params, &samples)
            .map_err(|e| RecognitionError::Provider(format!("Transcription failed: {:?}", e)))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| RecognitionError::Provider(format!("Failed to get segments: {:?}", e)))?;

        let mut text = String::new();
        for i in 0..num_segments {
            let segment = state
                .full_get_segment_text(i)
                .map_err(|e| RecognitionError::Provider(format!("Failed to get segment text: {:?}", e)))?;
            text.push_str(&segment);
        }

        let text = text.trim().to_string();
        debug!("Whisper transcribed {} segments: {:?}", num_segments, text);

        // whisper marks non-speech as bracketed annotations like [BLANK_AUDIO]
        if text.is_empty() || (text.starts_with('[') && text.ends_with(']')) {
            return Err(RecognitionError::Unintelligible);
        }
        Ok(text)
    }
}
