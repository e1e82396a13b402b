//! Audio capture from microphone
//!
//! cpal streams are not `Send`, so the device stream lives on its own
//! thread and frames cross into async code over a tokio channel.

use std::sync::{Arc, Mutex, PoisonError, mpsc as std_mpsc};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, SizedSample, StreamConfig};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per analysis frame (32ms at 16kHz)
pub const FRAME_SIZE: usize = 512;

/// A running microphone stream
///
/// Dropping the stream stops the device.
pub struct InputStream {
    frames: mpsc::UnboundedReceiver<Vec<f32>>,
    stop: Option<std_mpsc::Sender<()>>,
}

impl InputStream {
    /// Wrap a frame receiver with an optional device stop signal
    #[must_use]
    pub const fn new(
        frames: mpsc::UnboundedReceiver<Vec<f32>>,
        stop: Option<std_mpsc::Sender<()>>,
    ) -> Self {
        Self { frames, stop }
    }

    /// Next block of mono samples at `SAMPLE_RATE`, or `None` once the device stops
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Source of live mono microphone audio
pub trait AudioInput: Send + Sync {
    /// Open the device and start streaming
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no input is available or permission is denied
    fn open(&self) -> Result<InputStream>;
}

/// Default input device via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl CpalInput {
    /// Create the cpal-backed input
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AudioInput for CpalInput {
    fn open(&self) -> Result<InputStream> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);

        std::thread::Builder::new()
            .name("jarvis-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(frame_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Device(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until the InputStream is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Device("capture thread exited during setup".to_string()))??;

        tracing::debug!("audio capture started");
        Ok(InputStream::new(frame_rx, Some(stop_tx)))
    }
}

/// Find a 16kHz input config and build a stream that downmixes to mono
fn build_input_stream(tx: mpsc::UnboundedSender<Vec<f32>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .min_by_key(|c| c.channels())
        .ok_or_else(|| Error::Device("no 16kHz input config found".to_string()))?
        .with_sample_rate(SampleRate(SAMPLE_RATE));

    let format = supported_config.sample_format();
    let config: StreamConfig = supported_config.config();

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        ?format,
        "audio capture initialized"
    );

    match format {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, tx, |s| s),
        SampleFormat::I16 => input_stream::<i16>(&device, &config, tx, |s| f32::from(s) / 32768.0),
        SampleFormat::U16 => input_stream::<u16>(&device, &config, tx, |s| {
            (f32::from(s) - 32768.0) / 32768.0
        }),
        SampleFormat::U8 => {
            input_stream::<u8>(&device, &config, tx, |s| (f32::from(s) - 128.0) / 128.0)
        }
        other => Err(Error::Device(format!("unsupported sample format: {other:?}"))),
    }
}

fn input_stream<T: SizedSample + Copy + Send + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: mpsc::UnboundedSender<Vec<f32>>,
    convert: fn(T) -> f32,
) -> Result<cpal::Stream> {
    let channels = usize::from(config.channels.max(1));

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                #[allow(clippy::cast_precision_loss)]
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| frame.iter().map(|&s| convert(s)).sum::<f32>() / frame.len() as f32)
                    .collect();
                let _ = tx.send(mono);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}

#[derive(Default)]
struct TapState {
    live: bool,
    sink: Option<mpsc::UnboundedSender<Vec<f32>>>,
}

/// Fan-out point for live microphone frames
///
/// The detector feeds every frame through the tap while it is active; the
/// recorder attaches the single capture sink.
#[derive(Clone, Default)]
pub struct MicTap {
    inner: Arc<Mutex<TapState>>,
}

impl MicTap {
    /// Create a tap with no live stream
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TapState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the capture sink, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no microphone stream is live
    pub fn attach(&self) -> Result<mpsc::UnboundedReceiver<Vec<f32>>> {
        let mut state = self.state();
        if !state.live {
            return Err(Error::Device("microphone stream is not running".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.sink = Some(tx);
        Ok(rx)
    }

    /// Detach the capture sink; its receiver sees end-of-stream
    pub fn detach(&self) {
        self.state().sink = None;
    }

    /// Whether a microphone stream is feeding the tap
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state().live
    }

    /// Whether a capture sink is attached
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.state().sink.is_some()
    }

    /// Mark the stream live or stopped; stopping closes the capture sink
    pub(crate) fn set_live(&self, live: bool) {
        let mut state = self.state();
        state.live = live;
        if !live {
            state.sink = None;
        }
    }

    /// Forward a frame to the capture sink, if any
    pub(crate) fn feed(&self, frame: &[f32]) {
        let mut state = self.state();
        if let Some(sink) = &state.sink
            && sink.send(frame.to_vec()).is_err()
        {
            state.sink = None;
        }
    }
}
