//! Audio output: the source node and the devices that pull from it

use std::sync::{Arc, mpsc as std_mpsc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use tokio::sync::oneshot;

use crate::audio::{Analyser, AudioBuffer};
use crate::{Error, Result};

/// Plays a decoded buffer once, feeding the analyser as it goes
///
/// Fires its end-of-buffer signal the first time it renders past the last
/// frame.
pub struct SourceNode {
    buffer: Arc<AudioBuffer>,
    analyser: Arc<Analyser>,
    position: usize,
    on_ended: Option<oneshot::Sender<()>>,
    mono: Vec<f32>,
}

impl SourceNode {
    /// Connect a buffer to an analyser
    #[must_use]
    pub fn new(
        buffer: Arc<AudioBuffer>,
        analyser: Arc<Analyser>,
        on_ended: oneshot::Sender<()>,
    ) -> Self {
        Self {
            buffer,
            analyser,
            position: 0,
            on_ended: Some(on_ended),
            mono: Vec::new(),
        }
    }

    /// Channel count of the source buffer
    #[must_use]
    pub fn channels(&self) -> u16 {
        self.buffer.channels()
    }

    /// Sample rate of the source buffer
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.buffer.sample_rate()
    }

    /// Whether every frame has been rendered
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.position >= self.buffer.frames()
    }

    /// Fill an interleaved output block with `out_channels` channels
    ///
    /// Returns `false` once the buffer is exhausted; the rest of the block is
    /// silence.
    #[allow(clippy::cast_precision_loss)]
    pub fn render(&mut self, out: &mut [f32], out_channels: usize) -> bool {
        let out_channels = out_channels.max(1);
        let in_channels = usize::from(self.buffer.channels());
        let samples = self.buffer.samples();
        let frames = self.buffer.frames();

        self.mono.clear();
        for frame in out.chunks_mut(out_channels) {
            if self.position < frames {
                let base = self.position * in_channels;
                let input = &samples[base..base + in_channels];
                for (c, slot) in frame.iter_mut().enumerate() {
                    *slot = if in_channels == 1 {
                        input[0]
                    } else {
                        input[c.min(in_channels - 1)]
                    };
                }
                self.mono
                    .push(input.iter().sum::<f32>() / in_channels as f32);
                self.position += 1;
            } else {
                frame.fill(0.0);
            }
        }
        self.analyser.write(&self.mono);

        if self.is_finished() {
            if let Some(tx) = self.on_ended.take() {
                let _ = tx.send(());
            }
            return false;
        }
        true
    }
}

/// Handle to a running output; dropping it stops the device
pub struct OutputHandle {
    stop: Option<std_mpsc::Sender<()>>,
}

impl OutputHandle {
    /// Wrap the stop signal of an output thread
    #[must_use]
    pub const fn new(stop: std_mpsc::Sender<()>) -> Self {
        Self { stop: Some(stop) }
    }

    /// Stop the output now
    pub fn stop(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Device that renders source nodes
pub trait AudioOutput: Send + Sync {
    /// Rate the device renders at; buffers are resampled to it first.
    /// `None` accepts any rate.
    fn sample_rate(&self) -> Option<u32>;

    /// Start pulling from `source` on the device's own thread
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the output cannot be started
    fn start(&self, source: SourceNode) -> Result<OutputHandle>;
}

/// Default output device via cpal
pub struct CpalOutput {
    config: StreamConfig,
}

impl CpalOutput {
    /// Open the default output device at its preferred config
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;

        if supported.sample_format() != cpal::SampleFormat::F32 {
            tracing::warn!(
                format = ?supported.sample_format(),
                "default output is not f32, requesting f32 anyway"
            );
        }

        let config = supported.config();

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> Option<u32> {
        Some(self.config.sample_rate.0)
    }

    fn start(&self, mut source: SourceNode) -> Result<OutputHandle> {
        let config = self.config.clone();
        let channels = usize::from(config.channels);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);

        std::thread::Builder::new()
            .name("jarvis-playback".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    let _ = ready_tx.send(Err(Error::Audio("no output device".to_string())));
                    return;
                };

                let stream = match device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        source.render(data, channels);
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("playback stream closed");
            })
            .map_err(|e| Error::Audio(format!("failed to spawn playback thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited during setup".to_string()))??;

        Ok(OutputHandle::new(stop_tx))
    }
}

/// Renders on a timer thread without hardware
///
/// Used on headless machines and in tests. `speed` scales the render clock:
/// 1.0 is real time, 10.0 finishes ten times faster.
#[derive(Debug, Clone, Copy)]
pub struct SilentOutput {
    speed: f32,
}

impl Default for SilentOutput {
    fn default() -> Self {
        Self { speed: 1.0 }
    }
}

impl SilentOutput {
    /// Block size rendered per tick
    const BLOCK_FRAMES: usize = 1024;

    /// Create a silent output with a render speed factor
    #[must_use]
    pub const fn with_speed(speed: f32) -> Self {
        Self { speed }
    }
}

impl AudioOutput for SilentOutput {
    fn sample_rate(&self) -> Option<u32> {
        None
    }

    #[allow(clippy::cast_precision_loss)]
    fn start(&self, mut source: SourceNode) -> Result<OutputHandle> {
        let channels = usize::from(source.channels());
        let tick = Duration::from_secs_f64(
            Self::BLOCK_FRAMES as f64
                / f64::from(source.sample_rate())
                / f64::from(self.speed.max(0.001)),
        );
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("jarvis-silent-output".to_string())
            .spawn(move || {
                let mut block = vec![0.0f32; Self::BLOCK_FRAMES * channels];
                while source.render(&mut block, channels) {
                    match stop_rx.recv_timeout(tick) {
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .map_err(|e| Error::Audio(format!("failed to spawn output thread: {e}")))?;

        Ok(OutputHandle::new(stop_tx))
    }
}
