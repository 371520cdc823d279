//! Outbound sends and their results.

use serde::{Deserialize, Serialize};

use crate::event::{ConversationId, Destination};

/// A message the bot wants to put on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Broadcast or a single node.
    pub target: Destination,
    /// Channel index to send on.
    pub channel: u32,
    /// Message text; split into parts by the dispatcher when too long.
    pub text: String,
    /// Radio node to send through. `None` picks the default node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl OutboundMessage {
    /// A broadcast on `channel`.
    pub fn broadcast(channel: u32, text: impl Into<String>) -> Self {
        Self {
            target: Destination::Broadcast,
            channel,
            text: text.into(),
            node: None,
        }
    }

    /// A direct message to `peer` on channel 0.
    pub fn direct(peer: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            target: Destination::Node(peer.into()),
            channel: 0,
            text: text.into(),
            node: None,
        }
    }

    /// Routes the send through a specific radio node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Sets the channel index.
    pub fn on_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    /// The conversation this message is recorded under.
    pub fn conversation(&self) -> ConversationId {
        match &self.target {
            Destination::Broadcast => ConversationId::Channel(self.channel),
            Destination::Node(peer) => ConversationId::Direct(peer.clone()),
        }
    }
}

/// State of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// Handed to the radio and confirmed.
    Sent,
    /// Handed to the radio; confirmation arrives asynchronously.
    Queued,
    /// Not sent.
    Failed,
}

/// What a radio transport reports for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// [`SendStatus::Sent`] or [`SendStatus::Queued`].
    pub status: SendStatus,
    /// Radio-assigned packet id, when known.
    pub message_id: Option<String>,
}

impl SendReceipt {
    /// A confirmed send.
    pub fn sent(message_id: Option<String>) -> Self {
        Self {
            status: SendStatus::Sent,
            message_id,
        }
    }

    /// A send whose confirmation is pending.
    pub fn queued(message_id: Option<String>) -> Self {
        Self {
            status: SendStatus::Queued,
            message_id,
        }
    }
}

/// Outcome of a whole (possibly multi-part) send, as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    /// Overall status. `Failed` if any part failed.
    pub status: SendStatus,
    /// Packet id of the last part handed to the radio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Number of parts the radio accepted.
    pub parts: usize,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    /// A failed send with no part delivered.
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            status: SendStatus::Failed,
            message_id: None,
            parts: 0,
            error: Some(error.to_string()),
        }
    }

    /// `true` unless the send failed.
    pub fn is_ok(&self) -> bool {
        self.status != SendStatus::Failed
    }
}
