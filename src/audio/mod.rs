//! Audio buffers, WAV handling and spectrum/tempo analysis

mod analyser;
mod buffer;
pub mod tempo;
pub mod wav;

pub use analyser::{Analyser, AnalyserConfig};
pub use buffer::{AudioBuffer, rms};
