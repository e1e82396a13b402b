//! Configuration management for the Jarvis voice session

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::session::ReconnectPolicy;
use crate::voice::{FRAME_SIZE, SAMPLE_RATE};
use crate::{Error, Result};

use file::JarvisConfigFile;

/// Default dialogue server HTTP base
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Default dialogue server WebSocket endpoint
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws";

/// Jarvis voice session configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Dialogue server endpoints
    pub server: ServerConfig,

    /// Voice activity detection
    pub vad: VadConfig,

    /// Recording limits
    pub recorder: RecorderConfig,

    /// Reply playback
    pub playback: PlaybackConfig,

    /// Waveform display
    pub visual: VisualConfig,
}

/// Dialogue server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// HTTP base URL; uploads go to `{api_url}/upload_audio`
    pub api_url: String,

    /// WebSocket URL of the session channel
    pub ws_url: String,

    /// Delay between reconnect attempts
    pub reconnect: ReconnectPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Voice activity detection tuning
///
/// Frame counts are in 512-sample frames at 16 kHz (32 ms each).
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// RMS at or above which a frame is voiced
    pub positive_threshold: f32,

    /// RMS below which a frame counts towards ending speech
    pub negative_threshold: f32,

    /// Consecutive voiced frames needed to start speech
    pub min_speech_frames: usize,

    /// Frames of audio kept from before the onset
    pub pre_speech_pad_frames: usize,

    /// Consecutive quiet frames needed to end speech
    pub redemption_frames: usize,

    /// Hard end-of-speech fallback after the last voiced frame
    pub silence_capture: Duration,

    /// Carry the utterance samples on the end event
    pub buffer_speech: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            positive_threshold: 0.03,
            negative_threshold: 0.015,
            min_speech_frames: 3,
            pre_speech_pad_frames: 3,
            redemption_frames: 8,
            silence_capture: Duration::from_secs(2),
            buffer_speech: true,
        }
    }
}

impl VadConfig {
    /// `silence_capture` expressed in frames, at least one
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn silence_capture_frames(&self) -> usize {
        let samples = self.silence_capture.as_nanos() * u128::from(SAMPLE_RATE);
        let per_frame = FRAME_SIZE as u128 * 1_000_000_000;
        (samples.div_ceil(per_frame) as usize).max(1)
    }
}

/// Recording limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Recording stops on its own after this long
    pub max_duration: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(15),
        }
    }
}

/// Reply playback configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Directory downloaded replies are staged in
    pub output_dir: PathBuf,

    /// Analyser FFT size; the snapshot has half as many bins
    pub fft_size: usize,

    /// Analyser smoothing constant
    pub smoothing: f32,

    /// Deadline for downloading one reply
    pub download_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            fft_size: 2048,
            smoothing: 0.3,
            download_timeout: Duration::from_secs(30),
        }
    }
}

/// Waveform display configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisualConfig {
    /// Radius drawn for a silent bin
    pub min_radius: f32,

    /// Radius drawn for a full-scale bin
    pub max_radius: f32,

    /// How often the frame feed samples the analyser
    pub frame_interval: Duration,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            min_radius: 100.0,
            max_radius: 240.0,
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Default staging directory: `<data_dir>/jarvis/outputs`
#[must_use]
pub fn default_output_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || std::env::temp_dir().join("jarvis").join("outputs"),
        |d| d.data_dir().join("jarvis").join("outputs"),
    )
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a merged value is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge env > TOML > defaults
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a merged value is invalid
    pub fn resolve(fc: JarvisConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let reconnect_delay = env("JARVIS_RECONNECT_DELAY_MS")
            .map(|v| {
                v.parse::<u64>().map_err(|e| {
                    Error::Config(format!("JARVIS_RECONNECT_DELAY_MS must be milliseconds: {e}"))
                })
            })
            .transpose()?
            .or(fc.server.reconnect_delay_ms)
            .map_or(ReconnectPolicy::DEFAULT_DELAY, Duration::from_millis);

        let reconnect = if fc.server.reconnect_backoff.unwrap_or(false) {
            ReconnectPolicy::Backoff {
                base: reconnect_delay,
                max: fc
                    .server
                    .reconnect_max_delay_ms
                    .map_or(Duration::from_secs(60), Duration::from_millis),
            }
        } else {
            ReconnectPolicy::Fixed(reconnect_delay)
        };

        let server = ServerConfig {
            api_url: env("API_URL")
                .or(fc.server.api_url)
                .unwrap_or(defaults.server.api_url),
            ws_url: env("WS_URL")
                .or(fc.server.ws_url)
                .unwrap_or(defaults.server.ws_url),
            reconnect,
        };

        let vad = VadConfig {
            positive_threshold: fc
                .vad
                .positive_threshold
                .unwrap_or(defaults.vad.positive_threshold),
            negative_threshold: fc
                .vad
                .negative_threshold
                .unwrap_or(defaults.vad.negative_threshold),
            min_speech_frames: fc
                .vad
                .min_speech_frames
                .unwrap_or(defaults.vad.min_speech_frames),
            pre_speech_pad_frames: fc
                .vad
                .pre_speech_pad_frames
                .unwrap_or(defaults.vad.pre_speech_pad_frames),
            redemption_frames: fc
                .vad
                .redemption_frames
                .unwrap_or(defaults.vad.redemption_frames),
            silence_capture: fc
                .vad
                .silence_capture_ms
                .map_or(defaults.vad.silence_capture, Duration::from_millis),
            buffer_speech: fc.vad.buffer_speech.unwrap_or(defaults.vad.buffer_speech),
        };

        let recorder = RecorderConfig {
            max_duration: fc
                .recorder
                .max_duration_ms
                .map_or(defaults.recorder.max_duration, Duration::from_millis),
        };

        let playback = PlaybackConfig {
            output_dir: env("JARVIS_OUTPUT_DIR")
                .or(fc.playback.output_dir)
                .map_or(defaults.playback.output_dir, PathBuf::from),
            fft_size: fc.playback.fft_size.unwrap_or(defaults.playback.fft_size),
            smoothing: fc.playback.smoothing.unwrap_or(defaults.playback.smoothing),
            download_timeout: fc
                .playback
                .download_timeout_secs
                .map_or(defaults.playback.download_timeout, Duration::from_secs),
        };

        let visual = VisualConfig {
            min_radius: fc.visual.min_radius.unwrap_or(defaults.visual.min_radius),
            max_radius: fc.visual.max_radius.unwrap_or(defaults.visual.max_radius),
            frame_interval: fc
                .visual
                .frame_interval_ms
                .map_or(defaults.visual.frame_interval, Duration::from_millis),
        };

        let config = Self {
            server,
            vad,
            recorder,
            playback,
            visual,
        };
        config.validate()?;

        tracing::debug!(
            api_url = %config.server.api_url,
            ws_url = %config.server.ws_url,
            output_dir = %config.playback.output_dir.display(),
            "configuration resolved"
        );

        Ok(config)
    }

    /// Check merged values
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid value
    pub fn validate(&self) -> Result<()> {
        let api = url::Url::parse(&self.server.api_url)
            .map_err(|e| Error::Config(format!("invalid api_url {}: {e}", self.server.api_url)))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "api_url must be http or https: {}",
                self.server.api_url
            )));
        }

        let ws = url::Url::parse(&self.server.ws_url)
            .map_err(|e| Error::Config(format!("invalid ws_url {}: {e}", self.server.ws_url)))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "ws_url must be ws or wss: {}",
                self.server.ws_url
            )));
        }

        if self.vad.negative_threshold > self.vad.positive_threshold {
            return Err(Error::Config(
                "vad negative_threshold must not exceed positive_threshold".to_string(),
            ));
        }
        if self.vad.min_speech_frames == 0 || self.vad.redemption_frames == 0 {
            return Err(Error::Config(
                "vad min_speech_frames and redemption_frames must be at least 1".to_string(),
            ));
        }

        if self.recorder.max_duration.is_zero() {
            return Err(Error::Config("recorder max_duration must be positive".to_string()));
        }

        let fft = self.playback.fft_size;
        if !fft.is_power_of_two() || !(32..=32_768).contains(&fft) {
            return Err(Error::Config(format!(
                "fft_size must be a power of two in 32..=32768, got {fft}"
            )));
        }
        if !(0.0..1.0).contains(&self.playback.smoothing) {
            return Err(Error::Config(format!(
                "smoothing must be in [0, 1), got {}",
                self.playback.smoothing
            )));
        }

        if self.visual.max_radius <= self.visual.min_radius {
            return Err(Error::Config(
                "visual max_radius must exceed min_radius".to_string(),
            ));
        }

        Ok(())
    }
}
