//! Session orchestration tests
//!
//! Full listen / record / upload / reply rounds against a local dialogue
//! server, with a scripted microphone and a silent speaker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use jarvis_voice::Config;
use jarvis_voice::audio::wav;
use jarvis_voice::session::{
    InboundMessage, MessageSink, OutboundMessage, SessionChannel, SessionEvent,
    SessionOrchestrator, SessionParts, SessionState,
};
use jarvis_voice::voice::{FRAME_SIZE, PlaybackEngine, SilentOutput, VadEvent};

mod common;
use common::{
    MockServer, ScriptedInput, corrupt_wav, eventually, staged_files, test_config, tone_wav,
    wait_for_state,
};

struct Harness {
    server: MockServer,
    input: ScriptedInput,
    dir: tempfile::TempDir,
    state: watch::Receiver<SessionState>,
    playback: Arc<PlaybackEngine>,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(speed: f32) -> Self {
        Self::start_with(speed, |_| {}).await
    }

    async fn start_with(speed: f32, tune: impl FnOnce(&mut Config)) -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&server, dir.path());
        tune(&mut config);
        let input = ScriptedInput::new();

        let (playback, playback_events) = PlaybackEngine::new(
            config.playback.clone(),
            Arc::new(SilentOutput::with_speed(speed)),
        );
        let (channel, inbound) =
            SessionChannel::connect(config.server.ws_url.clone(), config.server.reconnect);
        let sink: Arc<dyn MessageSink> = Arc::new(channel);

        let (orchestrator, streams) = SessionOrchestrator::new(
            &config,
            SessionParts {
                input: Arc::new(input.clone()),
                playback: Arc::clone(&playback),
                playback_events,
                sink,
                inbound,
            },
        );
        assert_eq!(orchestrator.state(), SessionState::Idle);
        let state = orchestrator.subscribe();

        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(orchestrator.run(streams, shutdown_rx));

        // Every open announces itself with `listen`
        server.expect_type("listen").await;

        Self {
            server,
            input,
            dir,
            state,
            playback,
            shutdown,
            task,
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn listen(&mut self) {
        self.server.send(r#"{"type":"start_listening"}"#);
        wait_for_state(&mut self.state, SessionState::Listening).await;
        let input = self.input.clone();
        eventually(move || input.is_open()).await;
    }

    async fn record(&mut self) {
        assert!(self.input.hush(2));
        assert!(self.input.speak(4));
        wait_for_state(&mut self.state, SessionState::Recording).await;
    }

    fn reply(&self, name: &str) {
        let url = self.server.file_url(name);
        self.server
            .send(&format!(r#"{{"type":"chat_response","audio_url":"{url}"}}"#));
    }

    /// Shut down and wait for the session to finish; hands back the staging dir
    async fn stop(self) -> tempfile::TempDir {
        self.shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap();
        self.dir
    }
}

#[tokio::test]
async fn test_full_round() {
    let mut h = Harness::start(20.0).await;
    h.server.serve_file("reply.wav", tone_wav(0.5, 16_000));

    h.listen().await;
    h.record().await;

    assert!(h.input.speak(4));
    assert!(h.input.hush(6));
    wait_for_state(&mut h.state, SessionState::Processing).await;

    let message = h.server.expect_type("process_audio").await;
    assert_eq!(message["filename"], "audio.wav");

    let uploads = h.server.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].field.as_deref(), Some("audio"));
    assert_eq!(uploads[0].filename.as_deref(), Some("audio.wav"));
    assert!(wav::is_wav(&uploads[0].bytes));
    // Pre-speech pad plus the voiced and redemption frames
    let decoded = wav::decode(&uploads[0].bytes).unwrap();
    assert!(decoded.frames() >= 8 * 512);

    // Microphone is released while the reply is pending
    let input = h.input.clone();
    eventually(move || !input.is_open()).await;

    h.reply("reply.wav");
    wait_for_state(&mut h.state, SessionState::Listening).await;

    assert_eq!(h.server.downloads(), 1);
    assert_eq!(staged_files(h.dir.path()), 0);
    assert!(!h.playback.is_busy());

    // Listening again on a fresh microphone stream
    let input = h.input.clone();
    eventually(move || input.is_open()).await;
    assert_eq!(h.input.opens(), 2);

    h.stop().await;
}

#[tokio::test]
async fn test_reply_dropped_while_recording() {
    let mut h = Harness::start(20.0).await;
    h.server.serve_file("reply.wav", tone_wav(0.5, 16_000));

    h.listen().await;
    h.record().await;

    h.reply("reply.wav");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.state(), SessionState::Recording);
    assert_eq!(h.server.downloads(), 0);
    assert!(!h.playback.is_busy());

    assert!(h.input.hush(6));
    wait_for_state(&mut h.state, SessionState::Processing).await;
    h.server.expect_type("process_audio").await;

    h.stop().await;
}

#[tokio::test]
async fn test_speech_ignored_while_reply_plays() {
    let mut h = Harness::start(2.0).await;
    h.server.serve_file("long.wav", tone_wav(2.0, 16_000));

    h.listen().await;
    h.reply("long.wav");

    let playback = Arc::clone(&h.playback);
    eventually(move || playback.is_playing()).await;
    assert_eq!(h.state(), SessionState::Processing);

    // The detector is paused, nothing reads the microphone
    let input = h.input.clone();
    eventually(move || !input.is_open()).await;
    assert!(!h.input.speak(6));
    assert_eq!(h.state(), SessionState::Processing);

    wait_for_state(&mut h.state, SessionState::Listening).await;
    assert_eq!(staged_files(h.dir.path()), 0);

    let input = h.input.clone();
    eventually(move || input.is_open()).await;
    h.record().await;

    h.stop().await;
}

#[tokio::test]
async fn test_reply_from_idle_ends_listening() {
    let mut h = Harness::start(20.0).await;
    h.server.serve_file("reply.wav", tone_wav(0.3, 16_000));

    h.reply("reply.wav");
    wait_for_state(&mut h.state, SessionState::Listening).await;
    assert_eq!(h.server.downloads(), 1);
    assert_eq!(staged_files(h.dir.path()), 0);

    h.stop().await;
}

#[tokio::test]
async fn test_invalid_reply_returns_to_idle() {
    let mut h = Harness::start(20.0).await;
    h.server
        .serve_file("bogus.wav", b"ID3\x04\x00 this is not a wave file".to_vec());

    h.listen().await;
    h.reply("bogus.wav");

    wait_for_state(&mut h.state, SessionState::Idle).await;
    // The server is asked for a new round
    h.server.expect_type("listen").await;

    assert_eq!(h.server.downloads(), 1);
    assert_eq!(staged_files(h.dir.path()), 0);
    assert!(!h.playback.is_busy());
    let input = h.input.clone();
    eventually(move || !input.is_open()).await;

    h.stop().await;
}

#[tokio::test]
async fn test_undecodable_reply_returns_to_idle() {
    let mut h = Harness::start(20.0).await;
    h.server.serve_file("broken.wav", corrupt_wav());

    h.listen().await;
    h.reply("broken.wav");

    wait_for_state(&mut h.state, SessionState::Idle).await;
    assert_eq!(staged_files(h.dir.path()), 0);

    // Next round works normally
    h.server.serve_file("reply.wav", tone_wav(0.3, 16_000));
    h.listen().await;

    h.stop().await;
}

#[tokio::test]
async fn test_missing_reply_returns_to_idle() {
    let mut h = Harness::start(20.0).await;

    h.listen().await;
    h.reply("nowhere.wav");

    wait_for_state(&mut h.state, SessionState::Idle).await;
    assert_eq!(staged_files(h.dir.path()), 0);

    h.stop().await;
}

#[tokio::test]
async fn test_upload_failure_returns_to_idle() {
    let mut h = Harness::start(20.0).await;
    h.server.set_upload_status(500);

    h.listen().await;
    h.record().await;
    assert!(h.input.hush(6));

    wait_for_state(&mut h.state, SessionState::Idle).await;
    h.server.expect_type("listen").await;
    assert_eq!(h.server.uploads().len(), 1);
    let input = h.input.clone();
    eventually(move || !input.is_open()).await;

    h.stop().await;
}

#[tokio::test]
async fn test_repeated_start_listening_is_ignored() {
    let mut h = Harness::start(20.0).await;

    h.listen().await;
    h.server.send(r#"{"type":"start_listening"}"#);
    h.server.send(r#"{"type":"mystery","payload":1}"#);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.state(), SessionState::Listening);
    assert_eq!(h.input.opens(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_releases_microphone() {
    let mut h = Harness::start(20.0).await;
    h.listen().await;
    h.record().await;

    let input = h.input.clone();
    h.stop().await;
    eventually(move || !input.is_open()).await;
}

#[tokio::test]
async fn test_deadline_ends_long_utterance() {
    let mut h = Harness::start_with(20.0, |config| {
        config.recorder.max_duration = Duration::from_millis(300);
    })
    .await;

    h.listen().await;
    h.record().await;

    // Keep talking past the recording limit
    for _ in 0..100 {
        if h.state() != SessionState::Recording {
            break;
        }
        let _ = h.input.speak(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_for_state(&mut h.state, SessionState::Processing).await;

    let message = h.server.expect_type("process_audio").await;
    assert_eq!(message["filename"], "audio.wav");

    let uploads = h.server.uploads();
    assert_eq!(uploads.len(), 1);
    let decoded = wav::decode(&uploads[0].bytes).unwrap();
    assert!(decoded.frames() >= FRAME_SIZE);

    let input = h.input.clone();
    eventually(move || !input.is_open()).await;

    h.stop().await;
}

#[tokio::test]
async fn test_deadline_for_other_recording_is_ignored() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let input = ScriptedInput::new();

    let (playback, playback_events) = PlaybackEngine::new(
        config.playback.clone(),
        Arc::new(SilentOutput::with_speed(20.0)),
    );
    let (sink, mut sent) = mpsc::unbounded_channel::<OutboundMessage>();
    let (_inbound_tx, inbound) = mpsc::unbounded_channel();

    let (mut orchestrator, mut streams) = SessionOrchestrator::new(
        &config,
        SessionParts {
            input: Arc::new(input.clone()),
            playback,
            playback_events,
            sink: Arc::new(sink),
            inbound,
        },
    );

    orchestrator
        .handle(SessionEvent::Channel(InboundMessage::StartListening))
        .await;
    assert_eq!(orchestrator.state(), SessionState::Listening);

    assert!(input.hush(2));
    assert!(input.speak(3));
    let event = tokio::time::timeout(Duration::from_secs(5), streams.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, SessionEvent::Vad(VadEvent::SpeechStarted));
    orchestrator.handle(event).await;
    assert_eq!(orchestrator.state(), SessionState::Recording);
    assert!(orchestrator.is_recording());

    orchestrator.handle(SessionEvent::RecordingDeadline(99)).await;
    assert_eq!(orchestrator.state(), SessionState::Recording);
    assert!(orchestrator.is_recording());
    assert!(server.uploads().is_empty());

    // Frames after the onset reach the recorder through the tap
    assert!(input.speak(2));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First recording of this session
    orchestrator.handle(SessionEvent::RecordingDeadline(1)).await;
    assert_eq!(orchestrator.state(), SessionState::Processing);
    assert!(!orchestrator.is_recording());

    let uploads = server.uploads();
    assert_eq!(uploads.len(), 1);
    let decoded = wav::decode(&uploads[0].bytes).unwrap();
    assert_eq!(decoded.frames(), 2 * FRAME_SIZE);
    assert_eq!(
        sent.try_recv().unwrap(),
        OutboundMessage::ProcessAudio {
            filename: "audio.wav".to_string()
        }
    );
}

#[tokio::test]
async fn test_microphone_loss_while_listening() {
    let mut h = Harness::start(20.0).await;
    h.listen().await;

    h.input.unplug();
    wait_for_state(&mut h.state, SessionState::Idle).await;
    h.server.expect_type("listen").await;

    // The next round opens a fresh stream
    h.listen().await;
    assert_eq!(h.input.opens(), 2);

    h.stop().await;
}

#[tokio::test]
async fn test_microphone_loss_while_recording() {
    let mut h = Harness::start_with(20.0, |config| {
        config.recorder.max_duration = Duration::from_millis(300);
    })
    .await;
    h.listen().await;
    h.record().await;

    h.input.unplug();
    wait_for_state(&mut h.state, SessionState::Idle).await;
    h.server.expect_type("listen").await;

    // Nothing is uploaded once the deadline passes
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.state(), SessionState::Idle);
    assert!(h.server.uploads().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_mid_reply_removes_staged_file() {
    let mut h = Harness::start(1.0).await;
    h.server.serve_file("long.wav", tone_wav(2.0, 16_000));

    h.listen().await;
    h.reply("long.wav");

    let playback = Arc::clone(&h.playback);
    let watched = Arc::clone(&playback);
    eventually(move || watched.is_playing()).await;
    assert_eq!(staged_files(h.dir.path()), 1);

    let dir = h.stop().await;
    assert_eq!(staged_files(dir.path()), 0);
    assert!(!playback.is_busy());
}

#[tokio::test]
async fn test_shutdown_interrupts_reply_download() {
    let mut h = Harness::start_with(20.0, |config| {
        config.playback.download_timeout = Duration::from_secs(30);
    })
    .await;

    h.listen().await;
    let url = format!("{}/slow.wav", h.server.api_url());
    h.server
        .send(&format!(r#"{{"type":"chat_response","audio_url":"{url}"}}"#));

    let playback = Arc::clone(&h.playback);
    let watched = Arc::clone(&playback);
    eventually(move || watched.is_busy()).await;

    let started = std::time::Instant::now();
    let dir = h.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!playback.is_busy());
    assert_eq!(staged_files(dir.path()), 0);
}
