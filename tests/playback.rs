//! Playback engine tests against a local file server

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use jarvis_voice::Error;
use jarvis_voice::config::PlaybackConfig;
use jarvis_voice::voice::{PlaybackEngine, PlaybackEvent, SilentOutput};

mod common;
use common::{MockServer, corrupt_wav, eventually, staged_files, test_config, tone_wav};

fn engine(
    server: &MockServer,
    dir: &std::path::Path,
    speed: f32,
) -> (Arc<PlaybackEngine>, mpsc::UnboundedReceiver<PlaybackEvent>) {
    let config = test_config(server, dir);
    PlaybackEngine::new(config.playback, Arc::new(SilentOutput::with_speed(speed)))
}

async fn finished(events: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> PlaybackEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for playback end")
        .expect("engine dropped")
}

#[tokio::test]
async fn test_reply_plays_and_is_cleaned_up() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.serve_file("reply.wav", tone_wav(0.5, 22_050));
    let (engine, mut events) = engine(&server, dir.path(), 10.0);

    let url = server.file_url("reply.wav");
    assert!(engine.play(&url).await.unwrap());
    assert!(engine.is_busy());

    let asset = engine.current_asset().expect("asset while playing");
    assert_eq!(asset.url, url);
    assert!(asset.validated);
    assert!(asset.staged_path.starts_with(dir.path()));
    assert!(asset.staged_path.exists());

    assert_eq!(
        finished(&mut events).await,
        PlaybackEvent::Finished {
            url: Some(url),
            stopped: false,
        }
    );
    assert!(!engine.is_busy());
    assert!(engine.current_asset().is_none());
    assert!(!asset.staged_path.exists());
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_non_wave_reply_is_rejected() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.serve_file("reply.mp3", b"ID3\x04\x00\x00\x00\x00\x00\x00 mpeg frames".to_vec());
    let (engine, mut events) = engine(&server, dir.path(), 10.0);

    let err = engine.play(&server.file_url("reply.mp3")).await.unwrap_err();
    assert!(matches!(err, Error::Format(_)), "got {err:?}");

    assert!(!engine.is_busy());
    assert_eq!(staged_files(dir.path()), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_undecodable_reply_is_rejected() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.serve_file("broken.wav", corrupt_wav());
    let (engine, _events) = engine(&server, dir.path(), 10.0);

    let err = engine.play(&server.file_url("broken.wav")).await.unwrap_err();
    assert!(
        matches!(err, Error::Decode(_) | Error::Format(_)),
        "got {err:?}"
    );
    assert!(!engine.is_busy());
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_missing_reply_is_network_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _events) = engine(&server, dir.path(), 10.0);

    let err = engine.play(&server.file_url("absent.wav")).await.unwrap_err();
    assert!(matches!(err, Error::Network(_)), "got {err:?}");
    assert_eq!(server.downloads(), 1);
    assert!(!engine.is_busy());
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn test_slow_download_times_out() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _events) = engine(&server, dir.path(), 10.0);

    let url = format!("{}/slow.wav", server.api_url());
    let started = std::time::Instant::now();
    let err = engine.play(&url).await.unwrap_err();

    assert!(matches!(err, Error::Network(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!engine.is_busy());
}

#[tokio::test]
async fn test_second_reply_is_refused_while_playing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.serve_file("a.wav", tone_wav(2.0, 16_000));
    server.serve_file("b.wav", tone_wav(0.2, 16_000));
    let (engine, mut events) = engine(&server, dir.path(), 1.0);

    assert!(engine.play(&server.file_url("a.wav")).await.unwrap());
    assert!(!engine.play(&server.file_url("b.wav")).await.unwrap());
    // The refused reply was never fetched
    assert_eq!(server.downloads(), 1);

    assert!(engine.stop());
    let event = finished(&mut events).await;
    assert!(matches!(
        event,
        PlaybackEvent::Finished { stopped: true, .. }
    ));
    assert!(!engine.stop());
    assert_eq!(staged_files(dir.path()), 0);

    // Idle again: the next reply plays
    assert!(engine.play(&server.file_url("b.wav")).await.unwrap());
    finished(&mut events).await;
}

#[tokio::test]
async fn test_snapshot_follows_playback() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.serve_file("tone.wav", tone_wav(2.0, 16_000));
    let (engine, mut events) = engine(&server, dir.path(), 1.0);

    let bins = PlaybackConfig::default().fft_size / 2;
    assert_eq!(engine.bin_count(), bins);
    assert_eq!(engine.frequency_snapshot(), vec![0; bins]);

    assert!(engine.play(&server.file_url("tone.wav")).await.unwrap());
    let watched = Arc::clone(&engine);
    eventually(move || watched.frequency_snapshot().iter().any(|&b| b > 0)).await;
    assert_eq!(engine.frequency_snapshot().len(), bins);

    engine.stop();
    finished(&mut events).await;
    assert_eq!(engine.frequency_snapshot(), vec![0; bins]);
}
