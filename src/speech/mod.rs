//! Speech recognition and synthesis collaborators
//!
//! This module provides:
//! - The [`Recognizer`] boundary with an HTTP and (feature `whisper`) a local backend
//! - The [`Synthesizer`] boundary with a command-line voice and playback sinks
//! - Reply text cleanup and sentence splitting for speech output

pub mod recognizer;
#[cfg(feature = "whisper")]
pub mod stt;
pub mod text;
pub mod tts;

pub use recognizer::{HttpRecognizer, RecognitionConfig, RecognitionError, RecognitionProvider, Recognizer};
#[cfg(feature = "whisper")]
pub use stt::WhisperRecognizer;
pub use text::{clean_for_speech, strip_reasoning, SentenceSplitter};
pub use tts::{
    AudioSink, CommandVoice, PlaybackControl, PlaybackHandle, PlaybackReport, SinkSynthesizer, SpeechAudio,
    SynthesisConfig, SynthesisError, Synthesizer, TimedSink, Voice, VoiceSettings,
};
