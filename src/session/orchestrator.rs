//! Session state machine
//!
//! One task owns the detector, the recorder and the uploader, and shares the
//! playback engine with the visual feed. Events from the channel, the
//! detector, the recorder deadline and the playback engine are handled one
//! at a time, in arrival order.
//!
//! Recording and playback exclude each other: speech is ignored while a
//! reply is in flight, and a reply is dropped while recording.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::channel::MessageSink;
use super::messages::{InboundMessage, OutboundMessage};
use super::uploader::Uploader;
use crate::config::Config;
use crate::voice::{
    AudioInput, PlaybackEngine, PlaybackEvent, RecordedBlob, Recorder, SAMPLE_RATE, VadEvent,
    VoiceActivityDetector,
};
use crate::{Error, Result};

/// How long shutdown waits for playback teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Where the session is in its listen / record / reply cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the server to start a round
    Idle,
    /// Detector running, waiting for speech
    Listening,
    /// Capturing an utterance
    Recording,
    /// Uploading, waiting for the reply, or playing it
    Processing,
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Message from the session channel
    Channel(InboundMessage),
    /// Speech boundary from the detector
    Vad(VadEvent),
    /// Recording with this id reached its maximum length
    RecordingDeadline(u64),
    /// Playback cycle ended
    Playback(PlaybackEvent),
}

/// Collaborators supplied by the host
pub struct SessionParts {
    /// Microphone
    pub input: Arc<dyn AudioInput>,
    /// Shared reply player
    pub playback: Arc<PlaybackEngine>,
    /// Cycle-end events of `playback`
    pub playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    /// Outbound side of the session channel
    pub sink: Arc<dyn MessageSink>,
    /// Inbound side of the session channel
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

/// Every event stream the orchestrator listens to
pub struct SessionStreams {
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    vad: mpsc::UnboundedReceiver<VadEvent>,
    deadlines: mpsc::UnboundedReceiver<u64>,
    playback: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl SessionStreams {
    /// Next event from any stream; `None` once all are closed
    pub async fn next(&mut self) -> Option<SessionEvent> {
        tokio::select! {
            Some(message) = self.inbound.recv() => Some(SessionEvent::Channel(message)),
            Some(event) = self.vad.recv() => Some(SessionEvent::Vad(event)),
            Some(id) = self.deadlines.recv() => Some(SessionEvent::RecordingDeadline(id)),
            Some(event) = self.playback.recv() => Some(SessionEvent::Playback(event)),
            else => None,
        }
    }

    /// Wait for the engine to report a stopped cycle, bounded by `SHUTDOWN_GRACE`
    async fn wait_stopped(&mut self) {
        let stopped = async {
            while let Some(event) = self.playback.recv().await {
                if matches!(event, PlaybackEvent::Finished { stopped: true, .. }) {
                    return;
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, stopped).await.is_err() {
            tracing::warn!("playback cleanup did not finish before shutdown");
        }
    }
}

/// Drives one voice session
pub struct SessionOrchestrator {
    state: watch::Sender<SessionState>,
    vad: VoiceActivityDetector,
    recorder: Recorder,
    uploader: Uploader,
    playback: Arc<PlaybackEngine>,
    sink: Arc<dyn MessageSink>,
}

impl SessionOrchestrator {
    /// Wire up a session in the `Idle` state
    #[must_use]
    pub fn new(config: &Config, parts: SessionParts) -> (Self, SessionStreams) {
        let (vad_tx, vad_rx) = mpsc::unbounded_channel();
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();

        let vad = VoiceActivityDetector::new(parts.input, config.vad.clone(), vad_tx);
        let recorder = Recorder::new(vad.tap(), config.recorder.max_duration, deadline_tx);
        let (state, _) = watch::channel(SessionState::Idle);

        let orchestrator = Self {
            state,
            vad,
            recorder,
            uploader: Uploader::new(&config.server.api_url),
            playback: parts.playback,
            sink: parts.sink,
        };

        let streams = SessionStreams {
            inbound: parts.inbound,
            vad: vad_rx,
            deadlines: deadline_rx,
            playback: parts.playback_events,
        };

        (orchestrator, streams)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether a recording is open
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    /// Handle events until shutdown or until every stream closes
    ///
    /// Shutdown also interrupts an event in flight, such as a reply
    /// download or an upload. A playing reply is stopped and its staged
    /// file removed before this returns.
    pub async fn run(mut self, mut streams: SessionStreams, mut shutdown: mpsc::Receiver<()>) {
        tracing::info!("voice session running");

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                event = streams.next() => event,
            };

            let Some(event) = event else {
                tracing::info!("all session streams closed");
                break;
            };

            tokio::select! {
                () = self.handle(event) => {}
                _ = shutdown.recv() => {
                    tracing::info!("shutdown requested, abandoning event in flight");
                    break;
                }
            }
        }

        self.recorder.abort();
        self.vad.deactivate();
        if self.playback.stop() {
            streams.wait_stopped().await;
        }
        self.set_state(SessionState::Idle);
    }

    /// Apply one event
    pub async fn handle(&mut self, event: SessionEvent) {
        tracing::debug!(state = ?self.state(), ?event, "session event");

        match event {
            SessionEvent::Channel(InboundMessage::StartListening) => self.on_start_listening(),
            SessionEvent::Channel(InboundMessage::ChatResponse { audio_url }) => {
                self.on_chat_response(&audio_url).await;
            }
            SessionEvent::Channel(InboundMessage::Unknown) => {}
            SessionEvent::Vad(VadEvent::SpeechStarted) => self.on_speech_started(),
            SessionEvent::Vad(VadEvent::SpeechEnded(samples)) => {
                if self.state() == SessionState::Recording {
                    self.finish_recording(samples).await;
                }
            }
            SessionEvent::Vad(VadEvent::StreamEnded) => {
                if matches!(
                    self.state(),
                    SessionState::Listening | SessionState::Recording
                ) {
                    self.fail(&Error::Device("microphone stream ended".to_string()));
                }
            }
            SessionEvent::RecordingDeadline(id) => {
                let current = self.recorder.current().map(|r| r.id);
                if self.state() == SessionState::Recording && current == Some(id) {
                    tracing::info!(id, "recording deadline reached");
                    self.finish_recording(None).await;
                }
            }
            SessionEvent::Playback(PlaybackEvent::Finished { url, stopped }) => {
                self.on_playback_finished(url.as_deref(), stopped);
            }
        }
    }

    fn on_start_listening(&mut self) {
        if self.state() != SessionState::Idle {
            tracing::debug!(state = ?self.state(), "start_listening ignored");
            return;
        }

        match self.vad.activate() {
            Ok(()) => self.set_state(SessionState::Listening),
            Err(e) => self.fail(&e),
        }
    }

    fn on_speech_started(&mut self) {
        if self.state() != SessionState::Listening {
            return;
        }
        if self.playback.is_busy() {
            tracing::debug!("speech ignored while a reply is playing");
            return;
        }

        match self.recorder.start() {
            Ok(recording) => {
                tracing::debug!(id = recording.id, "capturing utterance");
                self.set_state(SessionState::Recording);
            }
            Err(e) => self.fail(&e),
        }
    }

    async fn finish_recording(&mut self, speech: Option<Vec<f32>>) {
        let recorded = match self.recorder.stop().await {
            Ok(blob) => blob,
            Err(e) => return self.fail(&e),
        };

        self.set_state(SessionState::Processing);
        self.vad.deactivate();

        let blob = match choose_blob(speech, recorded) {
            Ok(blob) => blob,
            Err(e) => return self.fail(&e),
        };

        match self.uploader.upload(&blob).await {
            Ok(filename) => {
                if !self.sink.send(OutboundMessage::ProcessAudio { filename }) {
                    tracing::warn!("process_audio not delivered");
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    async fn on_chat_response(&mut self, url: &str) {
        let state = self.state();
        if state == SessionState::Recording {
            tracing::warn!(url, "reply dropped while recording");
            return;
        }
        if self.playback.is_busy() {
            tracing::warn!(url, "reply dropped while another is playing");
            return;
        }

        // The microphone must not hear the reply
        self.vad.deactivate();
        self.set_state(SessionState::Processing);

        match self.playback.play(url).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(url, "playback refused");
                if state == SessionState::Listening {
                    self.on_playback_finished(None, false);
                } else {
                    self.set_state(state);
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    fn on_playback_finished(&mut self, url: Option<&str>, stopped: bool) {
        if self.state() != SessionState::Processing {
            tracing::debug!(url, stopped, "playback ended outside a reply cycle");
            return;
        }

        match self.vad.activate() {
            Ok(()) => self.set_state(SessionState::Listening),
            Err(e) => self.fail(&e),
        }
    }

    /// Log, release everything, go back to `Idle` and ask the server for a new round
    fn fail(&mut self, error: &Error) {
        tracing::error!(kind = error.kind(), error = %error, state = ?self.state(), "session cycle failed");

        self.recorder.abort();
        self.vad.deactivate();
        self.set_state(SessionState::Idle);

        if !self.sink.send(OutboundMessage::Listen) {
            tracing::debug!("listen not delivered after failure");
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(from = ?previous, to = ?next, "session state");
        }
    }
}

/// Prefer the detector's utterance (it includes the pre-speech pad) over
/// the raw recording
fn choose_blob(speech: Option<Vec<f32>>, recorded: Option<RecordedBlob>) -> Result<RecordedBlob> {
    let blob = match (speech, recorded) {
        (Some(samples), _) if !samples.is_empty() => {
            RecordedBlob::from_samples(&samples, SAMPLE_RATE)?
        }
        (_, Some(blob)) => blob,
        (_, None) => return Err(Error::Device("no recording to upload".to_string())),
    };

    if blob.is_empty() {
        return Err(Error::Device("recording captured no audio".to_string()));
    }
    Ok(blob)
}
