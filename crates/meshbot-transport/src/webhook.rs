//! Forwards inbound text to an HTTP webhook.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, ClientBuilder};
use serde_json::{Value, json};
use tracing::{debug, warn};

use meshbot_core::{EventObserver, InboundEvent, TransportError, TransportResult};

/// `User-Agent` sent with every webhook request.
pub const USER_AGENT: &str = concat!("meshbot/", env!("CARGO_PKG_VERSION"));

/// Posts every inbound text event as JSON. Delivery is fire-and-forget:
/// failures are logged and never reach the dispatcher.
pub struct WebhookForwarder {
    client: Client,
    url: String,
    node_urls: HashMap<String, String>,
}

impl WebhookForwarder {
    /// Creates a forwarder posting to `url` with a per-request `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::InvalidConfig(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            node_urls: HashMap::new(),
        })
    }

    /// Bridge URLs by node name, reported in the `node` field.
    pub fn with_node_urls(mut self, node_urls: HashMap<String, String>) -> Self {
        self.node_urls = node_urls;
        self
    }

    /// The JSON body for one event.
    pub fn payload(&self, event: &InboundEvent, channel_name: &str) -> Value {
        let node_name = event.node_key.as_deref().unwrap_or_default();
        json!({
            "timestamp": event.received_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "node": {
                "name": node_name,
                "url": self.node_urls.get(node_name),
            },
            "fromId": event.source_id,
            "toId": event.destination.as_wire_id(),
            "channel": event.channel_id,
            "channelName": channel_name,
            "text": event.text_body().unwrap_or_default(),
            "raw": event.meta.raw.clone().unwrap_or(Value::Null),
        })
    }
}

impl EventObserver for WebhookForwarder {
    fn name(&self) -> &str {
        "webhook"
    }

    fn observe(&self, event: &InboundEvent, channel_name: &str) {
        let body = self.payload(event, channel_name);
        let request = self.client.post(&self.url).json(&body);
        let event_id = event.id;

        tokio::spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => debug!(%event_id, status = %response.status(), "Webhook delivered"),
                Err(e) => warn!(%event_id, error = %e, "Webhook delivery failed"),
            }
        });
    }
}
