//! Waveform feed for the reply visualization
//!
//! Frequency snapshots become a closed polar line: one point per degree,
//! radius scaled linearly from the byte magnitude, plus a peak ring that
//! jumps above a new maximum and sinks back slowly. Rendering is left to a
//! `WaveformSink`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::VisualConfig;
use crate::voice::PlaybackEngine;

/// Points per revolution, one per degree including 360
pub const WAVE_POINTS: usize = 361;

/// Peak ring rise above a new maximum
const PEAK_RISE: f32 = 4.0;

/// Peak ring decay per frame
const PEAK_DECAY: f32 = 2.0;

/// Seconds per pulse ripple for a tempo
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn pulse_period(bpm: u32) -> Option<f32> {
    (bpm > 0).then(|| 150.0 / bpm as f32)
}

/// One point of the polar wave
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavePoint {
    /// Distance from the centre
    pub radius: f32,
    /// Angle in degrees
    pub angle: f32,
}

/// Everything a renderer needs for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct WaveFrame {
    /// `WAVE_POINTS` points plus a closing point at 360 degrees
    pub points: Vec<WavePoint>,
    /// Largest radius in this frame
    pub max_radius: f32,
    /// Radius of the peak ring
    pub peak_radius: f32,
    /// Ripple period derived from the reply tempo, when known
    pub pulse_period: Option<f32>,
}

/// Byte magnitude to display radius
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveMapping {
    min_radius: f32,
    max_radius: f32,
}

impl WaveMapping {
    /// Mapping between the configured radii
    #[must_use]
    pub const fn new(config: &VisualConfig) -> Self {
        Self {
            min_radius: config.min_radius,
            max_radius: config.max_radius,
        }
    }

    /// Radius drawn for a silent bin
    #[must_use]
    pub const fn min_radius(&self) -> f32 {
        self.min_radius
    }

    /// `m * (max - min) / 255 + min`
    #[must_use]
    pub fn radius(&self, magnitude: u8) -> f32 {
        f32::from(magnitude) * (self.max_radius - self.min_radius) / 255.0 + self.min_radius
    }

    /// Polar wave over the first `WAVE_POINTS` bins; missing bins are silent
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn wave(&self, bins: &[u8]) -> (Vec<WavePoint>, f32) {
        let mut points = Vec::with_capacity(WAVE_POINTS + 1);
        let mut max_radius = 0.0f32;

        for degree in 0..WAVE_POINTS {
            let radius = self.radius(bins.get(degree).copied().unwrap_or(0));
            max_radius = max_radius.max(radius);
            points.push(WavePoint {
                radius,
                angle: degree as f32,
            });
        }

        let first = points[0].radius;
        points.push(WavePoint {
            radius: first,
            angle: 360.0,
        });

        (points, max_radius)
    }
}

/// Peak ring that rises above a new maximum and decays per frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakHold {
    floor: f32,
    current: f32,
}

impl PeakHold {
    /// Start at the floor radius
    #[must_use]
    pub const fn new(floor: f32) -> Self {
        Self {
            floor,
            current: floor,
        }
    }

    /// Fold in one frame's maximum and return the ring radius
    pub fn update(&mut self, frame_max: f32) -> f32 {
        if frame_max > self.current {
            self.current = frame_max + PEAK_RISE;
        } else {
            self.current = (self.current - PEAK_DECAY).max(self.floor);
        }
        self.current
    }

    /// Current ring radius
    #[must_use]
    pub const fn current(&self) -> f32 {
        self.current
    }

    /// Drop back to the floor
    pub const fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Consumer of wave frames
pub trait WaveformSink: Send {
    /// Draw one frame
    fn frame(&mut self, frame: &WaveFrame);

    /// Playback ended; return to the resting display
    fn clear(&mut self) {}
}

/// Sink that only logs frame statistics
#[derive(Debug, Default)]
pub struct TracingSink {
    frames: u64,
}

impl WaveformSink for TracingSink {
    fn frame(&mut self, frame: &WaveFrame) {
        self.frames += 1;
        if self.frames.is_multiple_of(60) {
            tracing::debug!(
                frames = self.frames,
                max_radius = frame.max_radius,
                peak_radius = frame.peak_radius,
                pulse_period = frame.pulse_period,
                "waveform"
            );
        }
    }

    fn clear(&mut self) {
        tracing::trace!(frames = self.frames, "waveform cleared");
    }
}

/// Samples the playback analyser at a fixed cadence while a reply plays
pub struct FrameFeed {
    task: JoinHandle<()>,
}

impl FrameFeed {
    /// Start feeding `sink` from `engine`
    #[must_use]
    pub fn spawn(
        engine: Arc<PlaybackEngine>,
        config: VisualConfig,
        mut sink: Box<dyn WaveformSink>,
    ) -> Self {
        let mapping = WaveMapping::new(&config);
        let interval = config.frame_interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut peak = PeakHold::new(mapping.min_radius());
            let mut was_playing = false;

            loop {
                ticker.tick().await;

                if engine.is_playing() {
                    let frame = next_frame(&mapping, &mut peak, &engine.frequency_snapshot(), engine.tempo());
                    sink.frame(&frame);
                    was_playing = true;
                } else if was_playing {
                    peak.reset();
                    sink.clear();
                    was_playing = false;
                }
            }
        });

        Self { task }
    }

    /// Stop the feed
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Build one frame from a snapshot
#[must_use]
pub fn next_frame(
    mapping: &WaveMapping,
    peak: &mut PeakHold,
    bins: &[u8],
    tempo: Option<u32>,
) -> WaveFrame {
    let (points, max_radius) = mapping.wave(bins);
    let peak_radius = peak.update(max_radius);
    WaveFrame {
        points,
        max_radius,
        peak_radius,
        pulse_period: tempo.and_then(pulse_period),
    }
}
