use super::resampler::resample_audio;
use crate::speech::tts::{AudioSink, PlaybackControl, SpeechAudio, SynthesisError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Speaker playback through the default output device.
///
/// Each call to [`AudioSink::play`] opens a stream on the calling thread,
/// feeds it the rendered speech and returns once it has drained or the
/// playback was stopped.
pub struct SpeakerSink {
    device_name: Option<String>,
}

impl SpeakerSink {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn device(&self) -> Result<cpal::Device, SynthesisError> {
        let host = cpal::default_host();
        let device = match &self.device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| SynthesisError::Playback(format!("Failed to list output devices: {}", e)))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false)),
            None => host.default_output_device(),
        };
        device.ok_or_else(|| SynthesisError::Playback("No output device available".into()))
    }
}

impl AudioSink for SpeakerSink {
    fn play(&self, audio: &SpeechAudio, control: &PlaybackControl) -> Result<Duration, SynthesisError> {
        let device = self.device()?;
        debug!("Using output device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let config: StreamConfig = device
            .default_output_config()
            .map_err(|e| SynthesisError::Playback(format!("Failed to get output config: {}", e)))?
            .into();
        let channels = config.channels as usize;
        let device_rate = config.sample_rate.0;

        let samples = resample_audio(&audio.samples, audio.sample_rate, device_rate)
            .map_err(|e| SynthesisError::Playback(e.to_string()))?;
        let total = samples.len();
        let stream_buffer: Arc<[f32]> = samples.into();
        let position = Arc::new(AtomicUsize::new(0));

        let stream_position = Arc::clone(&position);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let start = stream_position.load(Ordering::Relaxed);
                    let frames = data.len() / channels;
                    let available = stream_buffer.len().saturating_sub(start).min(frames);

                    for i in 0..available {
                        let sample = stream_buffer[start + i];
                        for c in 0..channels {
                            data[i * channels + c] = sample;
                        }
                    }
                    data[available * channels..].fill(0.0);
                    stream_position.store(start + available, Ordering::Relaxed);
                },
                |err| error!("Audio output stream error: {}", err),
                None,
            )
            .map_err(|e| SynthesisError::Playback(format!("Failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| SynthesisError::Playback(format!("Failed to start output stream: {}", e)))?;
        info!("Playing {:.2}s of speech", audio.duration().as_secs_f32());

        // The device may stall; give up a second after the audio should have ended
        let deadline = Instant::now() + audio.duration() + Duration::from_secs(1);
        while position.load(Ordering::Relaxed) < total && !control.is_stopped() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        drop(stream);

        let played = position.load(Ordering::Relaxed);
        Ok(Duration::from_secs_f64(played as f64 / device_rate.max(1) as f64))
    }
}
