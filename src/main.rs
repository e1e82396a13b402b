use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use jarvis_voice::audio::{AudioBuffer, rms};
use jarvis_voice::session::{MessageSink, SessionChannel, SessionOrchestrator, SessionParts};
use jarvis_voice::visual::{FrameFeed, TracingSink};
use jarvis_voice::voice::{
    AudioInput, AudioOutput, CpalInput, CpalOutput, PlaybackEngine, PlaybackEvent, SAMPLE_RATE,
    SilentOutput,
};
use jarvis_voice::Config;

/// Jarvis - voice session client for a remote dialogue service
#[derive(Parser)]
#[command(name = "jarvis", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Render replies without a speaker (for headless machines)
    #[arg(long, env = "JARVIS_NO_AUDIO")]
    no_audio: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output through the playback engine
    TestSpeaker,
    /// Download and play one reply
    Play {
        /// URL of a WAV file
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,jarvis_voice=info",
        1 => "info,jarvis_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker(&config, cli.no_audio).await,
            Command::Play { url } => play_once(&config, cli.no_audio, &url).await,
        };
    }

    tracing::info!(
        api_url = %config.server.api_url,
        ws_url = %config.server.ws_url,
        no_audio = cli.no_audio,
        "starting jarvis"
    );

    let output = open_output(cli.no_audio)?;
    let input: Arc<dyn AudioInput> = Arc::new(CpalInput::new());
    let (playback, playback_events) = PlaybackEngine::new(config.playback.clone(), output);

    let (channel, inbound) =
        SessionChannel::connect(config.server.ws_url.clone(), config.server.reconnect);
    let sink: Arc<dyn MessageSink> = Arc::new(channel);

    let feed = FrameFeed::spawn(
        Arc::clone(&playback),
        config.visual,
        Box::new(TracingSink::default()),
    );

    let (orchestrator, streams) = SessionOrchestrator::new(
        &config,
        SessionParts {
            input,
            playback,
            playback_events,
            sink,
            inbound,
        },
    );

    // Set up shutdown signal
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    orchestrator.run(streams, shutdown_rx).await;
    feed.stop();

    tracing::info!("jarvis stopped");
    Ok(())
}

/// Open the speaker; a missing device is fatal unless running without audio
fn open_output(no_audio: bool) -> anyhow::Result<Arc<dyn AudioOutput>> {
    if no_audio {
        tracing::info!("audio output disabled, replies render silently");
        return Ok(Arc::new(SilentOutput::default()));
    }
    Ok(Arc::new(CpalOutput::new()?))
}

/// Print microphone levels once per second
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut stream = CpalInput::new().open()?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    for i in 0..duration {
        let mut samples = Vec::new();
        let second = tokio::time::sleep(Duration::from_secs(1));
        tokio::pin!(second);

        loop {
            tokio::select! {
                () = &mut second => break,
                block = stream.next_block() => match block {
                    Some(block) => samples.extend_from_slice(&block),
                    None => anyhow::bail!("microphone stream ended"),
                },
            }
        }

        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    drop(stream);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Play a tone through the same graph replies use
async fn test_speaker(config: &Config, no_audio: bool) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (std::f32::consts::TAU * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let (engine, mut events) = PlaybackEngine::new(config.playback.clone(), open_output(no_audio)?);
    println!("Playing {num_samples} samples at {sample_rate} Hz...");

    engine.play_buffer(AudioBuffer::mono(samples, sample_rate)).await?;
    wait_finished(&mut events).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// One full reply cycle: download, validate, decode, play, clean up
async fn play_once(config: &Config, no_audio: bool, url: &str) -> anyhow::Result<()> {
    let (engine, mut events) = PlaybackEngine::new(config.playback.clone(), open_output(no_audio)?);

    if !engine.play(url).await? {
        anyhow::bail!("playback engine busy");
    }

    let asset = engine.current_asset();
    wait_finished(&mut events).await?;

    if let Some(asset) = asset {
        println!("Played {} (staged at {})", asset.url, asset.staged_path.display());
    }
    match engine.tempo() {
        Some(bpm) => println!("Estimated tempo: {bpm} BPM"),
        None => println!("No tempo estimate"),
    }

    Ok(())
}

async fn wait_finished(events: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> anyhow::Result<()> {
    match events.recv().await {
        Some(PlaybackEvent::Finished { stopped, .. }) => {
            tracing::debug!(stopped, "playback finished");
            Ok(())
        }
        None => anyhow::bail!("playback engine dropped"),
    }
}
