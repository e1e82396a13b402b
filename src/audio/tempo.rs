//! Advisory tempo estimate for the visual pulse
//!
//! The buffer is rendered offline through a 100–150 Hz band-pass (where
//! beats usually sit), then peaks are picked per half-second window and
//! the intervals between the loudest peaks vote for a BPM in `[90, 180]`.

use super::AudioBuffer;

/// Neighbouring peaks compared against each peak
const MAX_NEIGHBOURS: usize = 10;

/// Lowest BPM after folding
const MIN_BPM: f64 = 90.0;

/// Highest BPM after folding
const MAX_BPM: f64 = 180.0;

/// RBJ biquad section, transposed direct form II
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn lowpass(cutoff: f64, q: f64, sample_rate: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff, q, sample_rate);
        Self::normalized(
            (1.0 - cos) / 2.0,
            1.0 - cos,
            (1.0 - cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    fn highpass(cutoff: f64, q: f64, sample_rate: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff, q, sample_rate);
        Self::normalized(
            (1.0 + cos) / 2.0,
            -(1.0 + cos),
            (1.0 + cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    fn prewarp(cutoff: f64, q: f64, sample_rate: f64) -> (f64, f64) {
        let w0 = 2.0 * std::f64::consts::PI * cutoff / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * q))
    }

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0.mul_add(x, self.z1);
        self.z1 = self.b1.mul_add(x, self.a1.mul_add(-y, self.z2));
        self.z2 = self.b2.mul_add(x, -self.a2 * y);
        y
    }
}

/// Band-pass one channel the way the offline render does
fn band_pass(samples: &[f32], sample_rate: u32) -> Vec<f32> {
    let rate = f64::from(sample_rate);
    let mut lowpass = Biquad::lowpass(150.0, 1.0, rate);
    let mut highpass = Biquad::highpass(100.0, 1.0, rate);

    #[allow(clippy::cast_possible_truncation)]
    samples
        .iter()
        .map(|&s| highpass.process(lowpass.process(f64::from(s))) as f32)
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Peak {
    position: usize,
    volume: f32,
}

/// Estimate the tempo of a decoded buffer
///
/// Returns `None` when the buffer is too short to hold two peaks.
#[must_use]
pub fn estimate_bpm(buffer: &AudioBuffer) -> Option<u32> {
    let rate = buffer.sample_rate();
    let left = band_pass(&buffer.channel_data(0), rate);
    let right = band_pass(&buffer.channel_data(1), rate);
    bpm_from_channels(&left, &right, rate)
}

/// Peak-interval tempo vote over two (already filtered) channels
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn bpm_from_channels(left: &[f32], right: &[f32], sample_rate: u32) -> Option<u32> {
    let window = (sample_rate / 2).max(1) as usize;
    let len = left.len().min(right.len());

    let mut peaks: Vec<Peak> = (0..len)
        .step_by(window)
        .filter_map(|start| {
            (start..(start + window).min(len))
                .map(|j| Peak {
                    position: j,
                    volume: left[j].abs().max(right[j].abs()),
                })
                .reduce(|best, p| if p.volume > best.volume { p } else { best })
        })
        .collect();

    peaks.sort_by(|a, b| b.volume.total_cmp(&a.volume));
    peaks.truncate(peaks.len() / 2);
    peaks.sort_by_key(|p| p.position);

    // (bpm, count) in first-seen order so ties resolve to the earliest interval
    let mut groups: Vec<(u32, usize)> = Vec::new();
    for (index, peak) in peaks.iter().enumerate() {
        for other in peaks.iter().skip(index + 1).take(MAX_NEIGHBOURS - 1) {
            let distance = other.position - peak.position;
            if distance == 0 {
                continue;
            }

            let mut bpm = 60.0 * f64::from(sample_rate) / distance as f64;
            while bpm < MIN_BPM {
                bpm *= 2.0;
            }
            while bpm > MAX_BPM {
                bpm /= 2.0;
            }
            let bpm = bpm.round() as u32;

            match groups.iter_mut().find(|(b, _)| *b == bpm) {
                Some((_, count)) => *count += 1,
                None => groups.push((bpm, 1)),
            }
        }
    }

    let best = groups.iter().map(|(_, c)| *c).max()?;
    groups.into_iter().find(|(_, c)| *c == best).map(|(bpm, _)| bpm)
}
