use super::AudioError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Frames fed to rubato per call
const CHUNK_SIZE: usize = 1024;

/// Mono sample-rate converter for bringing device audio to the engine rate.
///
/// Supports both one-shot conversion ([`resample`](Self::resample)) and
/// streaming conversion of arbitrarily sized chunks ([`push`](Self::push)),
/// which keeps the remainder of a chunk until a full block is available.
pub struct AudioResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    pending: Vec<f32>,
}

impl AudioResampler {
    /// Create a new mono resampler from `input_rate` to `output_rate`
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, AudioError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(AudioError::Format("Sample rates must be greater than 0".into()));
        }

        let resample_ratio = output_rate as f64 / input_rate as f64;

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(resample_ratio, 2.0, params, CHUNK_SIZE, 1)
            .map_err(|e| AudioError::Format(format!("Failed to create resampler: {}", e)))?;

        debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
        })
    }

    /// Convert a complete signal, zero-padding the final block
    pub fn resample(&mut self, input: &[f32]) -> Result<Vec<f32>, AudioError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let ratio = self.output_rate as f64 / self.input_rate as f64;
        let expected = (input.len() as f64 * ratio).ceil() as usize;
        let mut output = Vec::with_capacity(expected + CHUNK_SIZE);

        for block in input.chunks(CHUNK_SIZE) {
            let mut planar = vec![0.0f32; CHUNK_SIZE];
            planar[..block.len()].copy_from_slice(block);
            let processed = self.process_block(planar)?;

            let take = if block.len() < CHUNK_SIZE {
                ((block.len() as f64) * ratio).ceil() as usize
            } else {
                processed.len()
            };
            output.extend_from_slice(&processed[..take.min(processed.len())]);
        }

        debug!("Resampled {} samples -> {} samples", input.len(), output.len());
        Ok(output)
    }

    /// Streaming conversion: returns whatever complete blocks are available
    pub fn push(&mut self, input: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        while self.pending.len() >= CHUNK_SIZE {
            let rest = self.pending.split_off(CHUNK_SIZE);
            let block = std::mem::replace(&mut self.pending, rest);
            output.extend(self.process_block(block)?);
        }
        Ok(output)
    }

    fn process_block(&mut self, block: Vec<f32>) -> Result<Vec<f32>, AudioError> {
        let planar = vec![block];
        let mut out = self
            .resampler
            .process(&planar, None)
            .map_err(|e| AudioError::Format(format!("Resampling failed: {}", e)))?;
        Ok(out.pop().unwrap_or_default())
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Reset the filter state and drop pending input
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
    }
}

/// Resample mono audio in one step
pub fn resample_audio(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>, AudioError> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }

    let mut resampler = AudioResampler::new(input_rate, output_rate)?;
    resampler.resample(input)
}
