//! Reply playback: download, validate, decode and play one reply at a time
//!
//! A cycle moves the engine `Idle -> Decoding -> Playing -> Idle`. Only an
//! idle engine accepts `play`; everything else is refused with `false`.
//! Each cycle builds a fresh source and analyser, and the staged file is
//! deleted when the cycle ends however it ends.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::output::{AudioOutput, SourceNode};
use crate::audio::{Analyser, AnalyserConfig, AudioBuffer, tempo, wav};
use crate::config::PlaybackConfig;
use crate::{Error, Result};

/// Emitted when a playback cycle ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The graph was torn down and the staged file removed
    Finished {
        /// Reply URL, `None` for buffers played directly
        url: Option<String>,
        /// True when ended by `stop()` rather than the end of the buffer
        stopped: bool,
    },
}

/// A downloaded reply staged on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAsset {
    /// Where the reply was fetched from
    pub url: String,
    /// Local staging path
    pub staged_path: PathBuf,
    /// Whether the header check passed
    pub validated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Decoding,
    Playing,
}

struct Inner {
    state: EngineState,
    cycle: u64,
    asset: Option<ReplyAsset>,
    analyser: Option<Arc<Analyser>>,
    stop: Option<oneshot::Sender<()>>,
    tempo: Option<u32>,
}

/// Plays server replies through the output device
pub struct PlaybackEngine {
    config: PlaybackConfig,
    output: Arc<dyn AudioOutput>,
    client: reqwest::Client,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    inner: Mutex<Inner>,
}

impl PlaybackEngine {
    /// Create an idle engine; cycle ends are reported on the returned receiver
    #[must_use]
    pub fn new(
        config: PlaybackConfig,
        output: Arc<dyn AudioOutput>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            config,
            output,
            client: reqwest::Client::new(),
            events,
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                cycle: 0,
                asset: None,
                analyser: None,
                stop: None,
                tempo: None,
            }),
        });
        (engine, rx)
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the engine for a new cycle; `None` if it is busy
    fn claim(&self) -> Option<u64> {
        let mut inner = self.inner();
        if inner.state != EngineState::Idle {
            return None;
        }
        inner.state = EngineState::Decoding;
        inner.cycle += 1;
        inner.tempo = None;
        Some(inner.cycle)
    }

    fn release(&self) {
        let mut inner = self.inner();
        inner.state = EngineState::Idle;
        inner.asset = None;
        inner.analyser = None;
        inner.stop = None;
    }

    /// Download and play a reply
    ///
    /// Returns `Ok(false)` without side effects if a cycle is already in
    /// progress. On any failure the staged file is gone and the engine is
    /// idle again.
    ///
    /// # Errors
    ///
    /// - `Error::Network` if the download fails, times out, or is non-2xx
    /// - `Error::Format` if the reply is not a RIFF/WAVE file
    /// - `Error::Decode` if the samples cannot be decoded
    /// - `Error::Audio` if the output cannot be started
    pub async fn play(self: &Arc<Self>, url: &str) -> Result<bool> {
        let Some(cycle) = self.claim() else {
            tracing::warn!(url, "playback busy, reply dropped");
            return Ok(false);
        };

        tracing::info!(url, cycle, "fetching reply");
        let pending = PendingCycle::new(self);

        let (asset, buffer) = self.prepare(url).await?;
        let path = asset.staged_path.clone();
        if let Err(e) = self.start_graph(cycle, Some(asset), buffer).await {
            remove_staged(&path).await;
            return Err(e);
        }

        pending.disarm();
        Ok(true)
    }

    /// Play an already decoded buffer, skipping download and staging
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the output cannot be started
    pub async fn play_buffer(self: &Arc<Self>, buffer: AudioBuffer) -> Result<bool> {
        let Some(cycle) = self.claim() else {
            tracing::warn!("playback busy, buffer dropped");
            return Ok(false);
        };

        let pending = PendingCycle::new(self);
        self.start_graph(cycle, None, buffer).await?;
        pending.disarm();
        Ok(true)
    }

    async fn prepare(&self, url: &str) -> Result<(ReplyAsset, AudioBuffer)> {
        let bytes = self.download(url).await?;

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let mut asset = ReplyAsset {
            url: url.to_string(),
            staged_path: self
                .config
                .output_dir
                .join(format!("reply-{}.wav", Uuid::new_v4())),
            validated: false,
        };
        // Recorded before the write so an abandoned cycle can find the file
        self.inner().asset = Some(asset.clone());

        if let Err(e) = tokio::fs::write(&asset.staged_path, &bytes).await {
            remove_staged(&asset.staged_path).await;
            return Err(e.into());
        }
        tracing::debug!(path = %asset.staged_path.display(), bytes = bytes.len(), "reply staged");

        if let Err(e) = wav::validate_file(&asset.staged_path).await {
            tracing::warn!(url, error = %e, "reply rejected");
            remove_staged(&asset.staged_path).await;
            return Err(e);
        }
        asset.validated = true;
        self.inner().asset = Some(asset.clone());

        match self.decode(&asset.staged_path).await {
            Ok(buffer) => Ok((asset, buffer)),
            Err(e) => {
                tracing::warn!(url, error = %e, "reply could not be decoded");
                remove_staged(&asset.staged_path).await;
                Err(e)
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let fetch = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Network(format!("download failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::Network(format!("download returned {status}")));
            }

            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| Error::Network(format!("download interrupted: {e}")))
        };

        tokio::time::timeout(self.config.download_timeout, fetch)
            .await
            .map_err(|_| {
                Error::Network(format!(
                    "download timed out after {}s",
                    self.config.download_timeout.as_secs()
                ))
            })?
    }

    async fn decode(&self, path: &Path) -> Result<AudioBuffer> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Decode(format!("failed to read staged reply: {e}")))?;

        tokio::task::spawn_blocking(move || wav::decode(&bytes))
            .await
            .map_err(|e| Error::Decode(format!("decode task failed: {e}")))?
    }

    async fn start_graph(
        self: &Arc<Self>,
        cycle: u64,
        asset: Option<ReplyAsset>,
        buffer: AudioBuffer,
    ) -> Result<()> {
        let buffer = Arc::new(buffer);
        self.spawn_tempo(cycle, Arc::clone(&buffer));

        let buffer = match self.output.sample_rate() {
            Some(rate) if rate != buffer.sample_rate() => {
                let source = Arc::clone(&buffer);
                let resampled = tokio::task::spawn_blocking(move || source.resampled(rate))
                    .await
                    .map_err(|e| Error::Audio(format!("resample task failed: {e}")))??;
                Arc::new(resampled)
            }
            _ => buffer,
        };

        let analyser = Arc::new(Analyser::new(AnalyserConfig {
            fft_size: self.config.fft_size,
            smoothing: self.config.smoothing,
            ..AnalyserConfig::default()
        }));

        let (ended_tx, ended_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let frames = buffer.frames();
        let duration = buffer.duration();
        let node = SourceNode::new(buffer, Arc::clone(&analyser), ended_tx);
        let handle = self.output.start(node)?;

        let url = asset.as_ref().map(|a| a.url.clone());
        {
            let mut inner = self.inner();
            inner.state = EngineState::Playing;
            inner.asset = asset;
            inner.analyser = Some(analyser);
            inner.stop = Some(stop_tx);
        }

        tracing::info!(
            cycle,
            frames,
            secs = duration.as_secs_f32(),
            "playback started"
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let stopped = tokio::select! {
                _ = ended_rx => false,
                _ = stop_rx => true,
            };
            handle.stop();
            engine.finish(cycle, url, stopped).await;
        });

        Ok(())
    }

    fn spawn_tempo(self: &Arc<Self>, cycle: u64, buffer: Arc<AudioBuffer>) {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || tempo::estimate_bpm(&buffer)).await {
                Ok(Some(bpm)) => {
                    let Some(engine) = engine.upgrade() else {
                        return;
                    };
                    let mut inner = engine.inner();
                    if inner.cycle == cycle {
                        inner.tempo = Some(bpm);
                        tracing::debug!(cycle, bpm, "tempo estimated");
                    }
                }
                Ok(None) => tracing::debug!(cycle, "no tempo estimate"),
                Err(e) => tracing::debug!(error = %e, "tempo task failed"),
            }
        });
    }

    async fn finish(&self, cycle: u64, url: Option<String>, stopped: bool) {
        let asset = {
            let mut inner = self.inner();
            if inner.cycle != cycle {
                return;
            }
            inner.asset.take()
        };

        if let Some(asset) = &asset {
            remove_staged(&asset.staged_path).await;
        }
        self.release();

        tracing::info!(cycle, stopped, "playback finished");
        let _ = self.events.send(PlaybackEvent::Finished { url, stopped });
    }

    /// Stop the current playback
    ///
    /// Returns `false` if nothing is playing. Cleanup completes
    /// asynchronously and is announced with `PlaybackEvent::Finished`.
    pub fn stop(&self) -> bool {
        let stop = self.inner().stop.take();
        stop.is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Whether a buffer is playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.inner().state == EngineState::Playing
    }

    /// Whether a cycle is in progress (decoding or playing)
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner().state != EngineState::Idle
    }

    /// The reply being played, if any
    #[must_use]
    pub fn current_asset(&self) -> Option<ReplyAsset> {
        self.inner().asset.clone()
    }

    /// Snapshot of the byte frequency data; all zeros when idle
    #[must_use]
    pub fn frequency_snapshot(&self) -> Vec<u8> {
        let analyser = self.inner().analyser.clone();
        analyser.map_or_else(
            || vec![0; self.bin_count()],
            |analyser| analyser.byte_frequency_data(),
        )
    }

    /// Number of bins in a frequency snapshot
    #[must_use]
    pub const fn bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    /// Tempo estimate of the current reply, once computed
    #[must_use]
    pub fn tempo(&self) -> Option<u32> {
        self.inner().tempo
    }
}

/// Returns the engine to idle unless the cycle reached playback
///
/// Covers error returns and callers that drop `play` mid-download.
struct PendingCycle<'a> {
    engine: &'a PlaybackEngine,
    armed: bool,
}

impl<'a> PendingCycle<'a> {
    const fn new(engine: &'a PlaybackEngine) -> Self {
        Self {
            engine,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCycle<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let asset = self.engine.inner().asset.take();
        if let Some(asset) = asset {
            match std::fs::remove_file(&asset.staged_path) {
                Ok(()) => tracing::debug!(path = %asset.staged_path.display(), "abandoned reply removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %asset.staged_path.display(), error = %e, "failed to remove abandoned reply"),
            }
        }
        self.engine.release();
    }
}

async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "staged reply removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove staged reply"),
    }
}
