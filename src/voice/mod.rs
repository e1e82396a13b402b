//! Voice pipeline
//!
//! Microphone capture and speech detection on the way in, reply playback on
//! the way out. Devices sit behind the `AudioInput` / `AudioOutput` traits.

mod capture;
mod output;
mod playback;
mod recorder;
mod vad;

pub use capture::{AudioInput, CpalInput, FRAME_SIZE, InputStream, MicTap, SAMPLE_RATE};
pub use output::{AudioOutput, CpalOutput, OutputHandle, SilentOutput, SourceNode};
pub use playback::{PlaybackEngine, PlaybackEvent, ReplyAsset};
pub use recorder::{RecordedBlob, Recorder, Recording};
pub use vad::{DetectorState, SpeechDetector, VadEvent, VoiceActivityDetector};
