//! Inbound events and conversation addressing.
//!
//! An [`InboundEvent`] is the normalized form of anything that enters the
//! dispatcher: a packet heard by a radio node, or a synthetic event built by
//! the scheduler or the HTTP API. Events are immutable once built; the
//! `with_*` methods consume and return the event so producers can assemble
//! one fluently.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::OutboundMessage;

/// Wire id used for broadcast destinations.
pub const BROADCAST_ID: &str = "^all";

/// Numeric broadcast address used by the radio firmware.
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Returns `true` if `id` is any of the spellings of the broadcast address.
pub fn is_broadcast_id(id: &str) -> bool {
    matches!(
        id.trim().to_ascii_lowercase().as_str(),
        "^all" | "!ffffffff" | "ffffffff" | "0xffffffff"
    )
}

// =============================================================================
// Destination
// =============================================================================

/// Where a packet is addressed: everybody on a channel, or one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Destination {
    /// Broadcast on a channel.
    Broadcast,
    /// A single node, by id (for example `!a1b2c3d4`).
    Node(String),
}

impl Destination {
    /// Parses a wire id, recognising every broadcast spelling.
    pub fn parse(id: &str) -> Self {
        if is_broadcast_id(id) {
            Self::Broadcast
        } else {
            Self::Node(id.trim().to_string())
        }
    }

    /// Returns the id to put on the wire.
    pub fn as_wire_id(&self) -> &str {
        match self {
            Self::Broadcast => BROADCAST_ID,
            Self::Node(id) => id,
        }
    }

    /// Returns `true` for [`Destination::Broadcast`].
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.as_wire_id().to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_id())
    }
}

// =============================================================================
// Conversation
// =============================================================================

/// Identifies one conversation: a channel, or a direct-message thread with a peer.
///
/// The string form is `channel:<index>` or `dm:<peer id>`, which is also the
/// key the store truncates history by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConversationId {
    /// Broadcast traffic on a channel index.
    Channel(u32),
    /// Direct messages with a peer node.
    Direct(String),
}

impl ConversationId {
    /// Returns `"channel"` or `"dm"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Channel(_) => "channel",
            Self::Direct(_) => "dm",
        }
    }

    /// Channel index for channel conversations.
    pub fn channel(&self) -> Option<u32> {
        match self {
            Self::Channel(ch) => Some(*ch),
            Self::Direct(_) => None,
        }
    }

    /// Peer id for direct conversations.
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Channel(_) => None,
            Self::Direct(peer) => Some(peer),
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(ch) => write!(f, "channel:{ch}"),
            Self::Direct(peer) => write!(f, "dm:{peer}"),
        }
    }
}

/// Error returned when a conversation id string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid conversation id '{0}', expected 'channel:<n>' or 'dm:<peer>'")]
pub struct ParseConversationError(pub String);

impl FromStr for ConversationId {
    type Err = ParseConversationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some(("channel", ch)) => ch
                .parse()
                .map(Self::Channel)
                .map_err(|_| ParseConversationError(s.to_string())),
            Some(("dm", peer)) if !peer.is_empty() => Ok(Self::Direct(peer.to_string())),
            _ => Err(ParseConversationError(s.to_string())),
        }
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ParseConversationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.to_string()
    }
}

/// Direction of a stored message relative to the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the mesh (`rx`).
    In,
    /// Sent by the bot (`tx`).
    Out,
}

impl Direction {
    /// Returns `"in"` or `"out"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    /// Parses `in`/`out`, also accepting the radio-style `rx`/`tx`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" | "rx" => Some(Self::In),
            "out" | "tx" => Some(Self::Out),
            _ => None,
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Payload {
    /// Decoded text.
    Text(String),
    /// Opaque bytes.
    Binary(Vec<u8>),
}

/// Coarse classification of an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A text message.
    Text,
    /// Device or environment telemetry.
    Telemetry,
    /// A position report.
    Position,
    /// Anything else.
    Other,
}

/// Which producer created an event or a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Heard by a radio node.
    Radio,
    /// Synthesized by a scheduled job.
    Scheduler,
    /// Requested through the HTTP API.
    Api,
    /// Produced while handling another event (command or plugin reply).
    Reply,
    /// Sent by a plugin on its own, e.g. from `on_tick`.
    Plugin,
}

impl Origin {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Radio => "radio",
            Self::Scheduler => "scheduler",
            Self::Api => "api",
            Self::Reply => "reply",
            Self::Plugin => "plugin",
        }
    }
}

/// Short and long names a node advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderNames {
    /// Short name (up to four characters on most firmware).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    /// Long name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<String>,
}

impl SenderNames {
    /// Builds names, dropping empty or whitespace-only values.
    pub fn new(short: Option<&str>, long: Option<&str>) -> Self {
        fn norm(v: Option<&str>) -> Option<String> {
            v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
        }
        Self {
            short: norm(short),
            long: norm(long),
        }
    }

    /// Returns `true` when neither name is known.
    pub fn is_empty(&self) -> bool {
        self.short.is_none() && self.long.is_none()
    }

    /// The name to show for the node: long name, else short name.
    pub fn display(&self) -> Option<&str> {
        self.long.as_deref().or(self.short.as_deref())
    }
}

/// Radio-level metadata carried by a packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketMeta {
    /// Hop limit the packet started with.
    #[serde(default)]
    pub hop_start: Option<u32>,
    /// Hop limit remaining on arrival.
    #[serde(default)]
    pub hop_limit: Option<u32>,
    /// Whether the packet came in over an MQTT gateway.
    #[serde(default)]
    pub via_mqtt: bool,
    /// The raw packet as received, for webhooks and debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl PacketMeta {
    /// Hops travelled, `hop_start - hop_limit`, or 0 when unknown.
    pub fn hops(&self) -> u32 {
        match (self.hop_start, self.hop_limit) {
            (Some(start), Some(limit)) => start.saturating_sub(limit),
            _ => 0,
        }
    }

    /// `"MQTT"` or `"LoRa"`.
    pub fn via(&self) -> &'static str {
        if self.via_mqtt { "MQTT" } else { "LoRa" }
    }
}

/// A normalized inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Unique id assigned at creation.
    pub id: Uuid,
    /// Sending node id.
    pub source_id: String,
    /// Channel index the packet was heard on.
    pub channel_id: u32,
    /// Packet destination.
    pub destination: Destination,
    /// Decoded payload.
    pub payload: Payload,
    /// When the packet was received.
    pub received_at: DateTime<Utc>,
    /// Packet classification.
    pub kind: EventKind,
    /// Which producer created the event.
    pub origin: Origin,
    /// Name of the radio node that heard the packet.
    pub node_key: Option<String>,
    /// Names the sender advertised, if any.
    pub sender: SenderNames,
    /// Radio metadata.
    pub meta: PacketMeta,
}

impl InboundEvent {
    /// Creates a broadcast text event received now from the radio.
    pub fn text(source_id: impl Into<String>, channel_id: u32, text: impl Into<String>) -> Self {
        Self::new(
            source_id,
            channel_id,
            Payload::Text(text.into()),
            EventKind::Text,
        )
    }

    /// Creates a broadcast event with an explicit payload and kind.
    pub fn new(
        source_id: impl Into<String>,
        channel_id: u32,
        payload: Payload,
        kind: EventKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            channel_id,
            destination: Destination::Broadcast,
            payload,
            received_at: Utc::now(),
            kind,
            origin: Origin::Radio,
            node_key: None,
            sender: SenderNames::default(),
            meta: PacketMeta::default(),
        }
    }

    /// Sets the destination.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Sets the reception time.
    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Sets the producer.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Sets the receiving radio node.
    pub fn with_node_key(mut self, node_key: impl Into<String>) -> Self {
        self.node_key = Some(node_key.into());
        self
    }

    /// Sets the sender names.
    pub fn with_sender(mut self, sender: SenderNames) -> Self {
        self.sender = sender;
        self
    }

    /// Sets the radio metadata.
    pub fn with_meta(mut self, meta: PacketMeta) -> Self {
        self.meta = meta;
        self
    }

    /// The text body of a text event, trimmed. `None` for other kinds or empty text.
    pub fn text_body(&self) -> Option<&str> {
        match (&self.kind, &self.payload) {
            (EventKind::Text, Payload::Text(text)) => {
                Some(text.trim()).filter(|t| !t.is_empty())
            }
            _ => None,
        }
    }

    /// `true` when the event is a direct message rather than channel traffic.
    pub fn is_direct(&self) -> bool {
        !self.destination.is_broadcast()
    }

    /// The conversation this event belongs to.
    pub fn conversation(&self) -> ConversationId {
        if self.is_direct() {
            ConversationId::Direct(self.source_id.clone())
        } else {
            ConversationId::Channel(self.channel_id)
        }
    }

    /// Builds a reply: broadcast on the same channel for channel traffic,
    /// a DM to the sender otherwise. Sent through the node that heard the event.
    pub fn reply(&self, text: impl Into<String>) -> OutboundMessage {
        let target = if self.is_direct() {
            Destination::Node(self.source_id.clone())
        } else {
            Destination::Broadcast
        };
        OutboundMessage {
            target,
            channel: self.channel_id,
            text: text.into(),
            node: self.node_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_spellings() {
        for id in ["^all", "!ffffffff", "FFFFFFFF", "0xffffffff", " ^ALL "] {
            assert!(is_broadcast_id(id), "{id}");
        }
        assert!(!is_broadcast_id("!a1b2c3d4"));
        assert_eq!(Destination::parse("!ffffffff"), Destination::Broadcast);
    }

    #[test]
    fn test_conversation_id_round_trip() {
        let ch: ConversationId = "channel:3".parse().unwrap();
        assert_eq!(ch, ConversationId::Channel(3));
        let dm: ConversationId = "dm:!abcd".parse().unwrap();
        assert_eq!(dm.to_string(), "dm:!abcd");
        assert!("dm:".parse::<ConversationId>().is_err());
        assert!("channel:x".parse::<ConversationId>().is_err());
        assert!("C1".parse::<ConversationId>().is_err());
    }

    #[test]
    fn test_event_conversation_and_reply() {
        let channel = InboundEvent::text("!a", 2, "hi").with_node_key("base");
        assert_eq!(channel.conversation(), ConversationId::Channel(2));
        let reply = channel.reply("yo");
        assert_eq!(reply.target, Destination::Broadcast);
        assert_eq!(reply.channel, 2);
        assert_eq!(reply.node.as_deref(), Some("base"));

        let dm = InboundEvent::text("!a", 1, "hi")
            .with_destination(Destination::Node("!bot".into()));
        assert_eq!(dm.conversation(), ConversationId::Direct("!a".into()));
        assert_eq!(dm.reply("yo").target, Destination::Node("!a".into()));
    }

    #[test]
    fn test_text_body_ignores_non_text() {
        let ev = InboundEvent::new("!a", 0, Payload::Binary(vec![1]), EventKind::Telemetry);
        assert_eq!(ev.text_body(), None);
        assert_eq!(InboundEvent::text("!a", 0, "  ").text_body(), None);
        assert_eq!(InboundEvent::text("!a", 0, " /ping ").text_body(), Some("/ping"));
    }

    #[test]
    fn test_packet_meta_hops() {
        let meta = PacketMeta {
            hop_start: Some(3),
            hop_limit: Some(1),
            via_mqtt: true,
            raw: None,
        };
        assert_eq!(meta.hops(), 2);
        assert_eq!(meta.via(), "MQTT");
        assert_eq!(PacketMeta::default().hops(), 0);
    }

    #[test]
    fn test_sender_names_normalized() {
        let names = SenderNames::new(Some("  "), Some("Base Camp"));
        assert_eq!(names.short, None);
        assert_eq!(names.display(), Some("Base Camp"));
    }
}
