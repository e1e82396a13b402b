//! Decoded PCM buffer shared by decode, playback and tempo analysis

use std::time::Duration;

use crate::{Error, Result};

/// Decoded, interleaved PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Create a buffer from interleaved samples
    ///
    /// # Errors
    ///
    /// Returns error if the channel count or sample rate is zero, or the
    /// sample count is not a whole number of frames
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(Error::Decode("channel count must be non-zero".to_string()));
        }
        if sample_rate == 0 {
            return Err(Error::Decode("sample rate must be non-zero".to_string()));
        }
        if samples.len() % usize::from(channels) != 0 {
            return Err(Error::Decode(format!(
                "{} samples is not a whole number of {channels}-channel frames",
                samples.len()
            )));
        }

        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Create a single-channel buffer
    #[must_use]
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate: sample_rate.max(1),
        }
    }

    /// Interleaved samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of interleaved channels
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of frames (samples per channel)
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Playback length
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    /// True when the buffer holds no frames
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// De-interleave a single channel
    ///
    /// Out-of-range channel indexes clamp to the last channel so mono
    /// buffers can be read as if they were stereo.
    #[must_use]
    pub fn channel_data(&self, channel: u16) -> Vec<f32> {
        let channels = usize::from(self.channels);
        let index = usize::from(channel.min(self.channels - 1));
        self.samples
            .iter()
            .skip(index)
            .step_by(channels)
            .copied()
            .collect()
    }

    /// Resample every channel to `to_rate` using rubato
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built or fails mid-stream
    #[allow(clippy::cast_possible_truncation)]
    pub fn resampled(&self, to_rate: u32) -> Result<Self> {
        use rubato::{FftFixedIn, Resampler};

        if to_rate == self.sample_rate || self.is_empty() {
            return Ok(Self {
                samples: self.samples.clone(),
                channels: self.channels,
                sample_rate: to_rate,
            });
        }

        let chunk_size = 1024;
        let sub_chunks = 2;
        let channels = usize::from(self.channels);

        let mut resampler = FftFixedIn::<f64>::new(
            self.sample_rate as usize,
            to_rate as usize,
            chunk_size,
            sub_chunks,
            channels,
        )
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

        let planar: Vec<Vec<f64>> = (0..self.channels)
            .map(|c| {
                self.channel_data(c)
                    .into_iter()
                    .map(f64::from)
                    .collect()
            })
            .collect();

        let mut output: Vec<Vec<f64>> = vec![Vec::new(); channels];
        let frames = self.frames();
        let mut start = 0;

        while start < frames {
            let end = (start + chunk_size).min(frames);
            let chunk: Vec<&[f64]> = planar.iter().map(|ch| &ch[start..end]).collect();
            let processed = if end - start == chunk_size {
                resampler.process(&chunk, None)
            } else {
                resampler.process_partial(Some(chunk.as_slice()), None)
            };
            let result = processed.map_err(|e| Error::Audio(format!("resample failed: {e}")))?;

            for (out, ch) in output.iter_mut().zip(result) {
                out.extend(ch);
            }
            start = end;
        }

        let out_frames = output.first().map_or(0, Vec::len);
        let mut samples = Vec::with_capacity(out_frames * channels);
        for i in 0..out_frames {
            for ch in &output {
                samples.push(ch[i] as f32);
            }
        }

        Ok(Self {
            samples,
            channels: self.channels,
            sample_rate: to_rate,
        })
    }
}

/// RMS energy of a block of samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
