//! Routes sends across several radio bridges and merges their packets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use meshbot_core::{
    InboundEvent, OutboundMessage, RadioTransport, SendReceipt, TransportError, TransportResult,
};

use super::bridge::{BackoffConfig, RadioBridge};

/// Packets buffered between the bridges and the consumer.
pub const INBOUND_BUFFER: usize = 256;

/// All configured radio nodes behind one [`RadioTransport`].
///
/// A send naming a node goes through that node; otherwise through the first
/// connected node, in configuration order.
pub struct RadioHub {
    bridges: Vec<Arc<RadioBridge>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RadioHub {
    /// Connects to every `(name, url)` node. Packets from all of them arrive
    /// on the returned receiver.
    pub fn connect<I, N, U>(nodes: I, backoff: BackoffConfig) -> (Self, mpsc::Receiver<InboundEvent>)
    where
        I: IntoIterator<Item = (N, U)>,
        N: Into<String>,
        U: Into<String>,
    {
        let (events_tx, events_rx) = mpsc::channel(INBOUND_BUFFER);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let bridges: Vec<_> = nodes
            .into_iter()
            .map(|(name, url)| {
                RadioBridge::spawn(
                    name,
                    url,
                    backoff,
                    events_tx.clone(),
                    cancel.clone(),
                    &tracker,
                )
            })
            .collect();
        info!(nodes = bridges.len(), "Radio hub started");

        let hub = Self {
            bridges,
            cancel,
            tracker,
        };
        (hub, events_rx)
    }

    pub fn bridges(&self) -> &[Arc<RadioBridge>] {
        &self.bridges
    }

    /// Node name to bridge URL.
    pub fn node_urls(&self) -> HashMap<String, String> {
        self.bridges
            .iter()
            .map(|b| (b.name().to_string(), b.url().to_string()))
            .collect()
    }

    fn select(&self, node: Option<&str>) -> TransportResult<&Arc<RadioBridge>> {
        match node.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => self
                .bridges
                .iter()
                .find(|b| b.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| TransportError::UnknownNode(name.to_string())),
            None => self
                .bridges
                .iter()
                .find(|b| b.is_connected())
                .or_else(|| self.bridges.first())
                .ok_or(TransportError::NoRadio),
        }
    }

    /// Closes every connection and waits for the bridge tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Radio hub stopped");
    }
}

#[async_trait]
impl RadioTransport for RadioHub {
    fn name(&self) -> &str {
        "radio-hub"
    }

    async fn send(&self, message: &OutboundMessage) -> TransportResult<SendReceipt> {
        self.select(message.node.as_deref())?.send(message).await
    }

    fn nodes(&self) -> Vec<String> {
        self.bridges.iter().map(|b| b.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use meshbot_core::SendStatus;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn test_select_by_name_and_default() {
        let (hub, _events) = RadioHub::connect(
            [("roof", "ws://127.0.0.1:9"), ("Base", "ws://127.0.0.1:9")],
            BackoffConfig::default(),
        );
        assert_eq!(hub.nodes(), ["roof", "Base"]);
        assert_eq!(hub.select(Some("base")).unwrap().name(), "Base");
        assert_eq!(hub.select(None).unwrap().name(), "roof");
        assert_eq!(hub.select(Some("  ")).unwrap().name(), "roof");
        assert!(matches!(
            hub.select(Some("cellar")),
            Err(TransportError::UnknownNode(n)) if n == "cellar"
        ));

        let err = hub
            .send(&OutboundMessage::broadcast(0, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected { .. }));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_hub_has_no_radio() {
        let (hub, _events) =
            RadioHub::connect(Vec::<(String, String)>::new(), BackoffConfig::default());
        let err = hub
            .send(&OutboundMessage::broadcast(0, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoRadio));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_trip_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bridge = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let packet = json!({
                "type": "packet",
                "packet": {
                    "fromId": "!a1b2c3d4",
                    "toId": "^all",
                    "channel": 0,
                    "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "/ping"}
                }
            });
            ws.send(Message::Text(packet.to_string().into()))
                .await
                .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<Value>(text.as_str()).unwrap();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("bridge socket ended: {other:?}"),
                }
            }
        });

        let (hub, mut events) =
            RadioHub::connect([("roof", format!("ws://{addr}"))], BackoffConfig::default());

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.source_id, "!a1b2c3d4");
        assert_eq!(event.node_key.as_deref(), Some("roof"));
        assert_eq!(event.text_body(), Some("/ping"));

        let receipt = hub
            .send(&OutboundMessage::broadcast(0, "Pong"))
            .await
            .unwrap();
        assert_eq!(receipt.status, SendStatus::Queued);
        assert_eq!(receipt.message_id.as_deref(), Some("1"));

        let frame = timeout(Duration::from_secs(5), bridge)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["type"], "sendText");
        assert_eq!(frame["text"], "Pong");
        assert_eq!(frame["destinationId"], "^all");

        hub.shutdown().await;
    }
}
