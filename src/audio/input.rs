use super::resampler::AudioResampler;
use super::{AudioError, AudioFrameSource, FrameAssembler, FrameWriter};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Raw callback chunks queued between the device callback and the framer
const CHUNK_QUEUE: usize = 64;

fn open_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to list input devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceUnavailable(format!("Input device not found: {}", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("No input device available".into())),
    }
}

/// Microphone frame source.
///
/// The cpal stream lives on its own thread (streams are not `Send`); the
/// callback only mixes to mono and hands chunks to a framing thread, which
/// resamples to the engine rate and pushes fixed-size frames.
pub struct MicrophoneSource {
    device_name: Option<String>,
    sample_rate: u32,
    frame_len: usize,
    stop_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl MicrophoneSource {
    pub fn new(device_name: Option<String>, sample_rate: u32, frame_len: usize) -> Self {
        Self {
            device_name,
            sample_rate,
            frame_len,
            stop_tx: None,
            threads: Vec::new(),
        }
    }

    fn spawn_framer(
        &self,
        chunks: Receiver<Vec<f32>>,
        device_rate: u32,
        writer: FrameWriter,
    ) -> Result<JoinHandle<()>, AudioError> {
        let mut resampler = if device_rate != self.sample_rate {
            Some(AudioResampler::new(device_rate, self.sample_rate)?)
        } else {
            None
        };
        let mut assembler = FrameAssembler::new(self.frame_len, self.sample_rate);

        thread::Builder::new()
            .name("mic-framer".into())
            .spawn(move || {
                for chunk in chunks.iter() {
                    let samples = match resampler.as_mut() {
                        Some(r) => match r.push(&chunk) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("Dropping microphone chunk: {}", e);
                                continue;
                            }
                        },
                        None => chunk,
                    };
                    for frame in assembler.push(&samples) {
                        writer.push(frame);
                    }
                }
                writer.close();
                debug!("Microphone framer stopped");
            })
            .map_err(|e| AudioError::Stream(format!("Failed to spawn framer: {}", e)))
    }
}

impl AudioFrameSource for MicrophoneSource {
    fn start(&mut self, writer: FrameWriter) -> Result<(), AudioError> {
        let (chunk_tx, chunk_rx) = bounded::<Vec<f32>>(CHUNK_QUEUE);
        let (ready_tx, ready_rx) = bounded::<Result<u32, AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let device_name = self.device_name.clone();
        let lost = writer.clone();

        let stream_thread = thread::Builder::new()
            .name("mic-stream".into())
            .spawn(move || {
                let opened = open_device(device_name.as_deref()).and_then(|device| {
                    info!("Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));
                    let config: StreamConfig = device
                        .default_input_config()
                        .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to get input config: {}", e)))?
                        .into();
                    let channels = config.channels as usize;
                    let stream = device
                        .build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                let samples = if channels == 1 {
                                    data.to_vec()
                                } else {
                                    data.chunks(channels)
                                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                                        .collect()
                                };
                                if chunk_tx.try_send(samples).is_err() {
                                    debug!("Microphone chunk queue full");
                                }
                            },
                            move |err| {
                                error!("Audio input stream error: {}", err);
                                if let cpal::StreamError::DeviceNotAvailable = err {
                                    lost.fail(format!("input device lost: {}", err));
                                }
                            },
                            None,
                        )
                        .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to build input stream: {}", e)))?;
                    stream
                        .play()
                        .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to start input stream: {}", e)))?;
                    Ok((stream, config.sample_rate.0))
                });

                match opened {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        let _ = stop_rx.recv();
                        drop(stream);
                        info!("Stopped audio recording");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::Stream(format!("Failed to spawn input thread: {}", e)))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| AudioError::Stream("Input thread exited during start-up".into()))??;
        self.threads.push(stream_thread);
        self.stop_tx = Some(stop_tx);

        let framer = self.spawn_framer(chunk_rx, device_rate, writer)?;
        self.threads.push(framer);

        info!("Started audio recording at {} Hz (engine {} Hz)", device_rate, self.sample_rate);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Microphone thread panicked");
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}
