//! Jarvis Voice - voice session client for a remote dialogue service
//!
//! This library provides the voice-session orchestrator and its pipeline:
//! - Speech detection and bounded recording from the microphone
//! - Upload of utterances and a reconnecting session channel
//! - Download, validation, decode and playback of spoken replies
//! - A live frequency feed for the reply visualization
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Dialogue server                      │
//! │      WebSocket channel   │   HTTP upload / replies   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               SessionOrchestrator                    │
//! │   VAD  │  Recorder  │  Uploader  │  PlaybackEngine   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │        Devices (cpal)   │   Waveform sink            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod visual;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{
    InboundMessage, OutboundMessage, ReconnectPolicy, SessionChannel, SessionOrchestrator,
    SessionState,
};
pub use voice::{PlaybackEngine, PlaybackEvent};
