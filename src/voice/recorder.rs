//! Bounded in-memory recording from the microphone tap

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::capture::{MicTap, SAMPLE_RATE};
use crate::audio::wav;
use crate::{Error, Result};

/// An open recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    /// Recording identifier, unique per recorder
    pub id: u64,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Monotonic deadline after which capture stops on its own
    pub deadline: Instant,
}

/// A finished recording encoded as 16-bit mono WAV
#[derive(Debug, Clone)]
pub struct RecordedBlob {
    wav: Vec<u8>,
    samples: usize,
    sample_rate: u32,
}

impl RecordedBlob {
    /// Encode captured samples
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Result<Self> {
        Ok(Self {
            wav: wav::encode_mono(samples, sample_rate)?,
            samples: samples.len(),
            sample_rate,
        })
    }

    /// Encoded WAV bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.wav
    }

    /// Number of captured samples
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.samples
    }

    /// Captured length
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples as f64 / f64::from(self.sample_rate))
    }

    /// True when nothing was captured
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

struct ActiveRecording {
    info: Recording,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Vec<f32>>,
}

/// Captures microphone frames until stopped or the deadline passes
pub struct Recorder {
    tap: MicTap,
    max_duration: Duration,
    deadlines: mpsc::UnboundedSender<u64>,
    active: Option<ActiveRecording>,
    next_id: u64,
}

impl Recorder {
    /// Create a recorder reading from `tap`; elapsed deadlines are reported
    /// on `deadlines` by recording id
    #[must_use]
    pub const fn new(
        tap: MicTap,
        max_duration: Duration,
        deadlines: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            tap,
            max_duration,
            deadlines,
            active: None,
            next_id: 1,
        }
    }

    /// Open a recording
    ///
    /// A second start while recording returns the open recording.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no microphone stream is live
    pub fn start(&mut self) -> Result<Recording> {
        if let Some(active) = &self.active {
            tracing::warn!(id = active.info.id, "recorder already running");
            return Ok(active.info.clone());
        }

        let mut frames = self.tap.attach()?;
        let id = self.next_id;
        self.next_id += 1;

        let info = Recording {
            id,
            started_at: Utc::now(),
            deadline: Instant::now() + self.max_duration,
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let deadlines = self.deadlines.clone();
        let max_duration = self.max_duration;

        let task = tokio::spawn(async move {
            let mut samples = Vec::new();
            let deadline = tokio::time::sleep(max_duration);
            tokio::pin!(deadline);
            let mut tap_open = true;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        while let Ok(frame) = frames.try_recv() {
                            samples.extend_from_slice(&frame);
                        }
                        break;
                    }
                    frame = frames.recv(), if tap_open => match frame {
                        Some(frame) => samples.extend_from_slice(&frame),
                        // The deadline stays armed until the owner stops us
                        None => {
                            tracing::debug!(id, "capture tap closed");
                            tap_open = false;
                        }
                    },
                    () = &mut deadline => {
                        tracing::info!(id, "recording reached max duration");
                        let _ = deadlines.send(id);
                        break;
                    }
                }
            }

            samples
        });

        tracing::info!(id, max_secs = self.max_duration.as_secs_f32(), "recording started");

        self.active = Some(ActiveRecording {
            info: info.clone(),
            stop_tx,
            task,
        });

        Ok(info)
    }

    /// Close the recording and release the capture handle
    ///
    /// Returns `None` if nothing was recording.
    ///
    /// # Errors
    ///
    /// Returns error if the capture task failed or encoding fails
    pub async fn stop(&mut self) -> Result<Option<RecordedBlob>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };

        let _ = active.stop_tx.send(());
        self.tap.detach();

        let samples = active
            .task
            .await
            .map_err(|e| Error::Device(format!("capture task failed: {e}")))?;

        let blob = RecordedBlob::from_samples(&samples, SAMPLE_RATE)?;
        tracing::info!(
            id = active.info.id,
            samples = blob.sample_count(),
            secs = blob.duration().as_secs_f32(),
            "recording stopped"
        );

        Ok(Some(blob))
    }

    /// Discard the recording without encoding it
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
            self.tap.detach();
            tracing::debug!(id = active.info.id, "recording discarded");
        }
    }

    /// Whether a recording is open
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// The open recording, if any
    #[must_use]
    pub fn current(&self) -> Option<&Recording> {
        self.active.as_ref().map(|a| &a.info)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.abort();
    }
}
