//! Shared test utilities
//!
//! A scripted microphone and a local dialogue server (WebSocket channel,
//! upload endpoint and reply files) bound to `127.0.0.1:0`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};

use jarvis_voice::audio::wav;
use jarvis_voice::config::{Config, VadConfig};
use jarvis_voice::session::{ReconnectPolicy, SessionState};
use jarvis_voice::voice::{AudioInput, FRAME_SIZE, InputStream};

/// Microphone fed by the test
#[derive(Clone, Default)]
pub struct ScriptedInput {
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>,
    opens: Arc<AtomicUsize>,
}

impl ScriptedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one block to the open stream; false if none is open
    pub fn push(&self, block: Vec<f32>) -> bool {
        let current = self.current.lock().unwrap();
        current.as_ref().is_some_and(|tx| tx.send(block).is_ok())
    }

    pub fn speak(&self, frames: usize) -> bool {
        (0..frames).all(|_| self.push(loud_frame()))
    }

    pub fn hush(&self, frames: usize) -> bool {
        (0..frames).all(|_| self.push(quiet_frame()))
    }

    /// Whether a stream is open and being read
    pub fn is_open(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Close the open stream as if the device went away
    pub fn unplug(&self) {
        self.current.lock().unwrap().take();
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl AudioInput for ScriptedInput {
    fn open(&self) -> jarvis_voice::Result<InputStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.current.lock().unwrap() = Some(tx);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(InputStream::new(rx, None))
    }
}

pub fn loud_frame() -> Vec<f32> {
    #[allow(clippy::cast_precision_loss)]
    (0..FRAME_SIZE)
        .map(|i| (i as f32 * 0.2).sin() * 0.5)
        .collect()
}

pub fn quiet_frame() -> Vec<f32> {
    vec![0.0; FRAME_SIZE]
}

/// Mono 16-bit WAV of a 440 Hz tone
pub fn tone_wav(secs: f32, sample_rate: u32) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let len = (sample_rate as f32 * secs) as usize;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..len)
        .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / sample_rate as f32).sin() * 0.5)
        .collect();
    wav::encode_mono(&samples, sample_rate).unwrap()
}

/// Valid RIFF/WAVE prefix followed by garbage instead of chunks
pub fn corrupt_wav() -> Vec<u8> {
    let mut bytes = b"RIFF\x40\x00\x00\x00WAVE".to_vec();
    bytes.extend_from_slice(b"junkjunkjunkjunkjunkjunk");
    bytes
}

/// A recorded upload
#[derive(Debug, Clone)]
pub struct Upload {
    pub field: Option<String>,
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

enum Push {
    Text(String),
    Close,
}

#[derive(Default)]
struct ServerState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    downloads: AtomicUsize,
    uploads: Mutex<Vec<Upload>>,
    upload_status: AtomicU16,
    connections: AtomicUsize,
    push: Mutex<Option<mpsc::UnboundedSender<Push>>>,
    received: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// Local dialogue server
pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ServerState {
            upload_status: AtomicU16::new(200),
            received: Mutex::new(Some(received_tx)),
            ..ServerState::default()
        });

        let app = Router::new()
            .route("/ws", any(ws_handler))
            .route("/upload_audio", post(upload_handler))
            .route("/files/{name}", get(file_handler))
            .route("/slow.wav", get(slow_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            received: tokio::sync::Mutex::new(received_rx),
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn file_url(&self, name: &str) -> String {
        format!("http://{}/files/{name}", self.addr)
    }

    pub fn serve_file(&self, name: &str, bytes: Vec<u8>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes);
    }

    pub fn downloads(&self) -> usize {
        self.state.downloads.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.uploads.lock().unwrap().clone()
    }

    pub fn set_upload_status(&self, status: u16) {
        self.state.upload_status.store(status, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Send a text frame to the connected client
    pub fn send(&self, json: &str) {
        let push = self.state.push.lock().unwrap();
        push.as_ref()
            .expect("no client connected")
            .send(Push::Text(json.to_string()))
            .unwrap();
    }

    /// Close the current client connection from the server side
    pub fn kick(&self) {
        if let Some(push) = self.state.push.lock().unwrap().take() {
            let _ = push.send(Push::Close);
        }
    }

    /// Wait for the next text frame from the client
    pub async fn next_message(&self) -> String {
        let mut received = self.received.lock().await;
        tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("server stopped")
    }

    /// Wait for a text frame of the given `type`, skipping others
    pub async fn expect_type(&self, kind: &str) -> serde_json::Value {
        loop {
            let text = self.next_message().await;
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    *state.push.lock().unwrap() = Some(push_tx);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            push = push_rx.recv() => match push {
                Some(Push::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Push::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let received = state.received.lock().unwrap();
                    if let Some(tx) = received.as_ref() {
                        let _ = tx.send(text.as_str().to_owned());
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn upload_handler(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> StatusCode {
    while let Ok(Some(field)) = multipart.next_field().await {
        let field_name = field.name().map(str::to_owned);
        let filename = field.file_name().map(str::to_owned);
        let bytes = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        state.uploads.lock().unwrap().push(Upload {
            field: field_name,
            filename,
            bytes,
        });
    }
    StatusCode::from_u16(state.upload_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn file_handler(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    state.downloads.fetch_add(1, Ordering::SeqCst);
    let file = state.files.lock().unwrap().get(&name).cloned();
    match file {
        Some(bytes) => (StatusCode::OK, bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn slow_handler() -> Response {
    tokio::time::sleep(Duration::from_secs(10)).await;
    (StatusCode::OK, tone_wav(0.1, 16_000)).into_response()
}

/// Detector tuned for `loud_frame` / `quiet_frame`
pub fn test_vad() -> VadConfig {
    VadConfig {
        positive_threshold: 0.1,
        negative_threshold: 0.05,
        min_speech_frames: 3,
        pre_speech_pad_frames: 2,
        redemption_frames: 4,
        silence_capture: Duration::from_secs(2),
        buffer_speech: true,
    }
}

/// Session config pointed at `server`, staging into `output_dir`
pub fn test_config(server: &MockServer, output_dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.api_url = server.api_url();
    config.server.ws_url = server.ws_url();
    config.server.reconnect = ReconnectPolicy::Fixed(Duration::from_millis(100));
    config.vad = test_vad();
    config.recorder.max_duration = Duration::from_secs(5);
    config.playback.output_dir = output_dir.to_path_buf();
    config.playback.download_timeout = Duration::from_millis(500);
    config
}

/// Wait until the watched state equals `want`
pub async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .map(|r| r.is_ok());
    assert_eq!(reached, Ok(true), "timed out waiting for {want:?}");
}

/// Wait until `check` holds, polling
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

/// Files left in the staging directory
pub fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, Iterator::count)
}
