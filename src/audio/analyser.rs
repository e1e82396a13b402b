//! Frequency-domain analysis node
//!
//! The output callback writes rendered samples into a ring of the last
//! `fft_size` samples. Snapshots window that ring (Blackman), run an FFT,
//! smooth the magnitudes against the previous snapshot, and map decibels
//! into `0..=255`.

use std::sync::{Arc, Mutex, PoisonError};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Analysis node settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyserConfig {
    /// FFT window length; bin count is half of this
    pub fft_size: usize,
    /// Weight of the previous snapshot in `0.0..1.0`
    pub smoothing: f32,
    /// Decibel value mapped to byte 0
    pub min_decibels: f32,
    /// Decibel value mapped to byte 255
    pub max_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing: 0.3,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

impl AnalyserConfig {
    /// Number of frequency bins in each snapshot
    #[must_use]
    pub const fn bin_count(&self) -> usize {
        self.fft_size / 2
    }
}

struct Ring {
    samples: Vec<f32>,
    write: usize,
}

/// Frequency tap between the source node and the output
pub struct Analyser {
    config: AnalyserConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    ring: Mutex<Ring>,
    smoothed: Mutex<Vec<f32>>,
}

impl Analyser {
    /// Create an analyser; `fft_size` must be a power of two (validated by config loading)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: AnalyserConfig) -> Self {
        let size = config.fft_size.max(2);
        let fft = FftPlanner::new().plan_fft_forward(size);

        let window = (0..size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
                0.08f32.mul_add((2.0 * x).cos(), 0.42 - 0.5 * x.cos())
            })
            .collect();

        Self {
            config: AnalyserConfig {
                fft_size: size,
                ..config
            },
            fft,
            window,
            ring: Mutex::new(Ring {
                samples: vec![0.0; size],
                write: 0,
            }),
            smoothed: Mutex::new(vec![0.0; size / 2]),
        }
    }

    /// Number of bins in each snapshot
    #[must_use]
    pub const fn bin_count(&self) -> usize {
        self.config.bin_count()
    }

    /// Push rendered mono samples into the time-domain ring
    ///
    /// Called from the audio output thread.
    pub fn write(&self, samples: &[f32]) {
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let len = ring.samples.len();
        for &s in samples {
            let w = ring.write;
            ring.samples[w] = s;
            ring.write = (w + 1) % len;
        }
    }

    /// Copy of the ring in chronological order
    fn time_domain(&self) -> Vec<f32> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::with_capacity(ring.samples.len());
        out.extend_from_slice(&ring.samples[ring.write..]);
        out.extend_from_slice(&ring.samples[..ring.write]);
        out
    }

    /// Byte-domain magnitudes, one per bin, lowest frequency first
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let size = self.config.fft_size;
        let mut spectrum: Vec<Complex<f32>> = self
            .time_domain()
            .iter()
            .zip(&self.window)
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();

        self.fft.process(&mut spectrum);

        let tau = self.config.smoothing.clamp(0.0, 1.0);
        let range = self.config.max_decibels - self.config.min_decibels;
        let mut smoothed = self.smoothed.lock().unwrap_or_else(PoisonError::into_inner);

        smoothed
            .iter_mut()
            .zip(&spectrum)
            .map(|(prev, bin)| {
                let magnitude = bin.norm() / size as f32;
                *prev = tau.mul_add(*prev, (1.0 - tau) * magnitude);
                let db = if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    f32::NEG_INFINITY
                };
                (255.0 / range * (db - self.config.min_decibels)).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}
