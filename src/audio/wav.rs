//! WAV encode/decode and a file-backed frame source

use super::resampler::resample_audio;
use super::{AudioError, AudioFrameSource, FrameAssembler, FrameWriter};
use crate::{ParleyError, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

fn spec(sample_rate: u32, channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Write f32 samples (-1.0..1.0) to a 16-bit WAV file
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32, channels: u16) -> Result<()> {
    let mut writer = WavWriter::create(path.as_ref(), spec(sample_rate, channels))
        .map_err(|e| ParleyError::Io(format!("Failed to create WAV writer: {}", e)))?;

    for &sample in samples {
        let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(sample_i16)
            .map_err(|e| ParleyError::Io(format!("Failed to write sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| ParleyError::Io(format!("Failed to finalize WAV file: {}", e)))?;

    info!("Wrote {} samples to WAV file: {:?}", samples.len(), path.as_ref());
    Ok(())
}

/// Encode mono samples as an in-memory 16-bit WAV (for upload to recognizers)
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(samples.len() * 2 + 44));
    {
        let mut writer = WavWriter::new(&mut cursor, spec(sample_rate, 1))
            .map_err(|e| ParleyError::Io(format!("Failed to create WAV writer: {}", e)))?;
        for &sample in samples {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| ParleyError::Io(format!("Failed to write sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| ParleyError::Io(format!("Failed to finalize WAV data: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Read a WAV file; returns (interleaved samples, sample_rate, channels)
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32, u16)> {
    let reader = WavReader::open(path.as_ref())
        .map_err(|e| ParleyError::Io(format!("Failed to open WAV file: {}", e)))?;
    let decoded = decode(reader)?;
    info!("Read {} samples from WAV file: {:?}", decoded.0.len(), path.as_ref());
    Ok(decoded)
}

/// Decode WAV data held in memory; returns (interleaved samples, sample_rate, channels)
pub fn decode_wav_bytes(bytes: &[u8]) -> Result<(Vec<f32>, u32, u16)> {
    let reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| ParleyError::Io(format!("Invalid WAV data: {}", e)))?;
    decode(reader)
}

fn decode<R: Read>(mut reader: WavReader<R>) -> Result<(Vec<f32>, u32, u16)> {
    let spec = reader.spec();

    debug!(
        "Decoding WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<std::result::Result<_, _>>(),
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_607.0))
            .collect::<std::result::Result<_, _>>(),
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / i32::MAX as f32))
            .collect::<std::result::Result<_, _>>(),
        (SampleFormat::Float, 32) => reader.samples::<f32>().collect::<std::result::Result<_, _>>(),
        (format, bits) => {
            return Err(ParleyError::Io(format!(
                "Unsupported WAV format: {:?} {} bits",
                format, bits
            )))
        }
    }
    .map_err(|e| ParleyError::Io(format!("Failed to read samples: {}", e)))?;

    Ok((samples, spec.sample_rate, spec.channels))
}

/// Average interleaved channels down to mono
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Replays a WAV file as a frame stream.
///
/// The file is decoded, mixed to mono and resampled up front; a pusher thread
/// then emits frames (optionally paced to real time) and closes the writer at
/// end of file.
pub struct WavFileSource {
    path: PathBuf,
    sample_rate: u32,
    frame_len: usize,
    realtime: bool,
    trailing_silence: Duration,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavFileSource {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32, frame_len: usize) -> Self {
        Self {
            path: path.into(),
            sample_rate,
            frame_len,
            realtime: true,
            trailing_silence: Duration::ZERO,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Push frames as fast as the buffer accepts them instead of in real time
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    /// Append silence after the file so captures can close on trailing silence
    pub fn with_trailing_silence(mut self, silence: Duration) -> Self {
        self.trailing_silence = silence;
        self
    }

    fn load(&self) -> std::result::Result<Vec<f32>, AudioError> {
        let (samples, rate, channels) =
            read_wav(&self.path).map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
        let mono = to_mono(&samples, channels);
        let mut resampled = resample_audio(&mono, rate, self.sample_rate)?;
        let pad = (self.trailing_silence.as_secs_f64() * self.sample_rate as f64) as usize;
        resampled.extend(std::iter::repeat(0.0).take(pad));
        Ok(resampled)
    }
}

impl AudioFrameSource for WavFileSource {
    fn start(&mut self, writer: FrameWriter) -> std::result::Result<(), AudioError> {
        let samples = self.load()?;
        let mut assembler = FrameAssembler::new(self.frame_len, self.sample_rate);
        let stop = Arc::clone(&self.stop);
        let realtime = self.realtime;
        let path = self.path.clone();

        stop.store(false, Ordering::SeqCst);
        info!("Replaying {:?} ({} samples)", path, samples.len());

        let handle = thread::Builder::new()
            .name("wav-source".into())
            .spawn(move || {
                let mut frames = assembler.push(&samples);
                frames.extend(assembler.flush());
                for frame in frames {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let pace = frame.duration();
                    writer.push(frame);
                    if realtime {
                        thread::sleep(pace);
                    }
                }
                writer.close();
                debug!("WAV source finished: {:?}", path);
            })
            .map_err(|e| AudioError::Stream(format!("Failed to spawn WAV source: {}", e)))?;

        self.worker = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("WAV source thread panicked");
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for WavFileSource {
    fn drop(&mut self) {
        self.stop();
    }
}
