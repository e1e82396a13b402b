//! Persistent WebSocket connection to the dialogue server
//!
//! The connection task owns the socket. It sends `listen` on every open,
//! forwards parsed inbound messages in arrival order, and reconnects after a
//! delay whenever the socket closes. It exits when the channel or its
//! inbound receiver is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use super::messages::{InboundMessage, OutboundMessage};

/// Delay between connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay after every close
    Fixed(Duration),

    /// `base * 2^(failures - 1)` capped at `max`, less up to 25% jitter
    Backoff {
        /// First delay
        base: Duration,
        /// Delay ceiling
        max: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(Self::DEFAULT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Fixed delay used unless configured otherwise
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(3);

    /// Delay before the next attempt after `failures` consecutive failed or
    /// closed connections (1-based)
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Backoff { base, max } => {
                let exp = failures.saturating_sub(1).min(16);
                let delay = base.saturating_mul(2u32.saturating_pow(exp)).min(max);
                let jitter = rand::thread_rng().gen_range(0.0..0.25);
                delay.mul_f64(1.0 - jitter)
            }
        }
    }
}

/// Fire-and-forget outbound messages
pub trait MessageSink: Send + Sync {
    /// Queue a message; `false` if it was dropped
    fn send(&self, message: OutboundMessage) -> bool;
}

impl MessageSink for mpsc::UnboundedSender<OutboundMessage> {
    fn send(&self, message: OutboundMessage) -> bool {
        Self::send(self, message).is_ok()
    }
}

/// Duplex session channel with automatic reconnect
pub struct SessionChannel {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    connected: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl SessionChannel {
    /// Start connecting to `url`; inbound messages arrive on the returned receiver
    #[must_use]
    pub fn connect(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let url = url.into();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicU32::new(0));

        let task = tokio::spawn(run_connection(
            url,
            policy,
            outbound_rx,
            inbound_tx,
            Arc::clone(&connected),
            Arc::clone(&attempts),
        ));

        let channel = Self {
            outbound,
            connected,
            attempts,
            task,
        };
        (channel, inbound_rx)
    }

    /// Whether the socket is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connection attempts made so far, successful or not
    #[must_use]
    pub fn connection_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }
}

impl MessageSink for SessionChannel {
    fn send(&self, message: OutboundMessage) -> bool {
        if !self.is_connected() {
            tracing::warn!(?message, "session channel not open, message dropped");
            return false;
        }
        self.outbound.send(message).is_ok()
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Closed {
    /// Socket closed or failed; reconnect
    Remote,
    /// Our side went away; stop for good
    Local,
}

async fn run_connection(
    url: String,
    policy: ReconnectPolicy,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    connected: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
) {
    let mut failures = 0u32;

    loop {
        let attempt = attempts.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(url = %url, attempt, "connecting session channel");

        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                failures = 0;

                // Messages queued while the socket was down are stale
                while outbound.try_recv().is_ok() {}
                connected.store(true, Ordering::Release);
                tracing::info!(url = %url, attempt, "session channel open");

                let closed = pump(ws, &mut outbound, &inbound).await;
                connected.store(false, Ordering::Release);

                if matches!(closed, Closed::Local) {
                    tracing::debug!("session channel shut down");
                    return;
                }
                tracing::warn!(url = %url, "session channel closed");
            }
            Err(e) => {
                tracing::warn!(url = %url, attempt, error = %e, "session channel connect failed");
            }
        }

        failures = failures.saturating_add(1);
        let delay = policy.delay(failures);
        tracing::info!(delay_ms = delay.as_millis(), "reconnecting session channel");

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = inbound.closed() => return,
        }
    }
}

async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    outbound: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: &mpsc::UnboundedSender<InboundMessage>,
) -> Closed
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    match OutboundMessage::Listen.to_json() {
        Ok(json) => {
            if let Err(e) = sink.send(Message::Text(json.into())).await {
                tracing::warn!(error = %e, "failed to send listen");
                return Closed::Remote;
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode listen"),
    }

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(None)).await;
                    return Closed::Local;
                };
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    tracing::warn!(error = %e, "session channel send failed");
                    return Closed::Remote;
                }
                tracing::debug!(?message, "sent");
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match InboundMessage::parse(text.as_str()) {
                    Ok(InboundMessage::Unknown) => {
                        tracing::debug!(raw = %text.as_str(), "ignoring unknown message type");
                    }
                    Ok(message) => {
                        tracing::debug!(?message, "received");
                        if inbound.send(message).is_err() {
                            let _ = sink.send(Message::Close(None)).await;
                            return Closed::Local;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, raw = %text.as_str(), "malformed message ignored");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "close frame received");
                    return Closed::Remote;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "session channel error");
                    return Closed::Remote;
                }
                None => return Closed::Remote,
            },
        }
    }
}
