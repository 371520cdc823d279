//! WebSocket client for one radio bridge, with reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use meshbot_core::{InboundEvent, OutboundMessage, SendReceipt, TransportError, TransportResult};

use super::packet::{OutboundFrame, decode_frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames waiting for the socket.
const OUTBOUND_BUFFER: usize = 64;

/// Reconnection delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// The delay after `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = Duration::from_secs_f64(current.as_secs_f64() * self.multiplier.max(1.0));
        next.min(self.max_delay)
    }
}

/// Connection to the bridge of one radio node.
///
/// The socket lives on a background task that reconnects until cancelled.
/// Sends are accepted only while connected and are reported as queued: the
/// bridge transmits asynchronously.
pub struct RadioBridge {
    name: String,
    url: String,
    frames: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    next_id: AtomicU32,
}

impl RadioBridge {
    /// Starts the connection task on `tracker`. Decoded packets go to `events`.
    pub fn spawn(
        name: impl Into<String>,
        url: impl Into<String>,
        backoff: BackoffConfig,
        events: mpsc::Sender<InboundEvent>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let name = name.into();
        let url = url.into();
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(false));

        let span = info_span!("radio", node = %name);
        tracker.spawn(
            run_bridge(
                name.clone(),
                url.clone(),
                backoff,
                frames_rx,
                events,
                Arc::clone(&connected),
                cancel,
            )
            .instrument(span),
        );

        Arc::new(Self {
            name,
            url,
            frames: frames_tx,
            connected,
            next_id: AtomicU32::new(1),
        })
    }

    /// Node name from the configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queues one text frame.
    pub async fn send(&self, message: &OutboundMessage) -> TransportResult<SendReceipt> {
        let not_connected = || TransportError::NotConnected {
            node: self.name.clone(),
        };
        if !self.is_connected() {
            return Err(not_connected());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&OutboundFrame::send_text(id, message))
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.frames.send(frame).await.map_err(|_| not_connected())?;

        debug!(
            node = %self.name,
            id,
            to = %message.target,
            channel = message.channel,
            "Queued text frame"
        );
        Ok(SendReceipt::queued(Some(id.to_string())))
    }
}

async fn run_bridge(
    name: String,
    url: String,
    backoff: BackoffConfig,
    mut frames: mpsc::Receiver<String>,
    events: mpsc::Sender<InboundEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut delay = backoff.initial_delay;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match attempt {
            Ok((stream, _response)) => {
                info!(url = %url, "Radio bridge connected");
                connected.store(true, Ordering::SeqCst);
                delay = backoff.initial_delay;

                let stop = serve_connection(&name, stream, &mut frames, &events, &cancel).await;
                connected.store(false, Ordering::SeqCst);
                if stop {
                    break;
                }
                warn!(url = %url, "Radio bridge disconnected");
            }
            Err(e) => {
                let err = TransportError::ConnectionFailed {
                    url: url.clone(),
                    reason: e.to_string(),
                };
                warn!(error = %err, retry_in = ?delay, "Radio bridge unavailable");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = backoff.next_delay(delay);
    }

    connected.store(false, Ordering::SeqCst);
    info!("Radio bridge stopped");
}

/// Pumps one open socket. Returns `true` when the bridge should stop.
async fn serve_connection(
    name: &str,
    stream: WsStream,
    frames: &mut mpsc::Receiver<String>,
    events: &mpsc::Sender<InboundEvent>,
    cancel: &CancellationToken,
) -> bool {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return true;
            }

            Some(frame) = frames.recv() => {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!(error = %e, "Failed to write frame");
                    return false;
                }
            }

            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => match decode_frame(text.as_str(), name) {
                    Some(event) => {
                        trace!(from = %event.source_id, kind = ?event.kind, "Packet received");
                        if events.send(event).await.is_err() {
                            return true;
                        }
                    }
                    None => trace!(len = text.len(), "Ignored bridge frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig::default();
        let mut delay = backoff.initial_delay;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay.as_secs());
            delay = backoff.next_delay(delay);
        }
        assert_eq!(seen, [1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_never_shrinks() {
        let backoff = BackoffConfig {
            multiplier: 0.5,
            ..BackoffConfig::default()
        };
        assert_eq!(
            backoff.next_delay(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        // Nothing listens on the discard port.
        let bridge = RadioBridge::spawn(
            "roof",
            "ws://127.0.0.1:9",
            BackoffConfig::default(),
            tx,
            cancel.clone(),
            &tracker,
        );

        let err = bridge
            .send(&OutboundMessage::broadcast(0, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected { node } if node == "roof"));

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(!bridge.is_connected());
    }
}
