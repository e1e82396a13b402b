//! TOML configuration file loading
//!
//! Supports `~/.config/jarvis/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct JarvisConfigFile {
    /// Dialogue server endpoints
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Voice activity detection tuning
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Recording limits
    #[serde(default)]
    pub recorder: RecorderFileConfig,

    /// Reply playback
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Waveform display
    #[serde(default)]
    pub visual: VisualFileConfig,
}

/// Server endpoints and reconnect behaviour
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// HTTP base URL (e.g. "http://localhost:8000")
    pub api_url: Option<String>,

    /// WebSocket URL (e.g. "ws://localhost:8000/ws")
    pub ws_url: Option<String>,

    /// Fixed reconnect delay in milliseconds
    pub reconnect_delay_ms: Option<u64>,

    /// Use exponential backoff instead of a fixed delay
    pub reconnect_backoff: Option<bool>,

    /// Backoff ceiling in milliseconds
    pub reconnect_max_delay_ms: Option<u64>,
}

/// Detector thresholds and frame counts
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub positive_threshold: Option<f32>,
    pub negative_threshold: Option<f32>,
    pub min_speech_frames: Option<usize>,
    pub pre_speech_pad_frames: Option<usize>,
    pub redemption_frames: Option<usize>,
    /// Fallback end-of-speech window in milliseconds
    pub silence_capture_ms: Option<u64>,
    pub buffer_speech: Option<bool>,
}

/// Recording limits
#[derive(Debug, Default, Deserialize)]
pub struct RecorderFileConfig {
    /// Maximum recording length in milliseconds
    pub max_duration_ms: Option<u64>,
}

/// Reply playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Staging directory for downloaded replies
    pub output_dir: Option<String>,

    /// Analyser FFT size (power of two)
    pub fft_size: Option<usize>,

    /// Analyser smoothing constant in `[0, 1)`
    pub smoothing: Option<f32>,

    /// Reply download deadline in seconds
    pub download_timeout_secs: Option<u64>,
}

/// Waveform display configuration
#[derive(Debug, Default, Deserialize)]
pub struct VisualFileConfig {
    pub min_radius: Option<f32>,
    pub max_radius: Option<f32>,
    /// Frame feed cadence in milliseconds
    pub frame_interval_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `JarvisConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> JarvisConfigFile {
    config_file_path().map_or_else(JarvisConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> JarvisConfigFile {
    if !path.exists() {
        return JarvisConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                JarvisConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            JarvisConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/jarvis/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("jarvis").join("config.toml"))
}
