//! JSON frames exchanged with a radio bridge.
//!
//! Inbound, the bridge forwards every packet its node hears:
//!
//! ```json
//! {"type": "packet", "packet": {"fromId": "!a1b2c3d4", "toId": "^all", "channel": 0,
//!   "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "hello"},
//!   "hopStart": 3, "hopLimit": 2, "viaMqtt": false, "rxTime": 1700000000}}
//! ```
//!
//! Outbound, the bot asks the bridge to transmit text:
//!
//! ```json
//! {"type": "sendText", "id": 7, "text": "hi", "destinationId": "^all", "channelIndex": 0}
//! ```
//!
//! Packet fields are read leniently: ids may be numbers or strings, and names
//! may sit under `decoded.user`, `user` or `decoded.sender`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

use meshbot_core::{
    BROADCAST_NUM, Destination, EventKind, InboundEvent, OutboundMessage, PacketMeta, Payload,
    SenderNames, is_broadcast_id,
};

/// A frame sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    /// Transmit a text packet.
    #[serde(rename_all = "camelCase")]
    SendText {
        id: u32,
        text: String,
        destination_id: String,
        channel_index: u32,
    },
}

impl OutboundFrame {
    /// The frame for one already-chunked message.
    pub fn send_text(id: u32, message: &OutboundMessage) -> Self {
        Self::SendText {
            id,
            text: message.text.clone(),
            destination_id: message.target.as_wire_id().to_string(),
            channel_index: message.channel,
        }
    }
}

/// Decodes a bridge frame into an event heard by `node`.
///
/// Returns `None` for frames that are not packets, and for packets without a
/// usable sender id.
pub fn decode_frame(frame: &str, node: &str) -> Option<InboundEvent> {
    let value: Value = serde_json::from_str(frame).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("packet") {
        return None;
    }
    packet_to_event(value.get("packet")?, node)
}

/// Normalizes one packet.
pub fn packet_to_event(packet: &Value, node: &str) -> Option<InboundEvent> {
    let source_id = from_id(packet)?;
    let decoded = packet.get("decoded").unwrap_or(&Value::Null);

    let (payload, kind) = match decoded.get("text").and_then(Value::as_str) {
        Some(text) => (Payload::Text(text.to_string()), EventKind::Text),
        None => (binary_payload(decoded), port_kind(decoded)),
    };
    let kind = match decoded.get("portnum").and_then(Value::as_str) {
        Some("TEXT_MESSAGE_APP") => EventKind::Text,
        _ => kind,
    };

    let channel = int_field(decoded.get("channel").or_else(|| packet.get("channel")))
        .and_then(|ch| u32::try_from(ch).ok())
        .unwrap_or(0);

    let destination = if is_broadcast(packet) {
        Destination::Broadcast
    } else {
        packet
            .get("toId")
            .and_then(Value::as_str)
            .map(Destination::parse)
            .unwrap_or(Destination::Broadcast)
    };

    let meta = PacketMeta {
        hop_start: int_field(packet.get("hopStart")).and_then(|v| u32::try_from(v).ok()),
        hop_limit: int_field(packet.get("hopLimit")).and_then(|v| u32::try_from(v).ok()),
        via_mqtt: packet
            .get("viaMqtt")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        raw: Some(packet.clone()),
    };

    let mut event = InboundEvent::new(source_id, channel, payload, kind)
        .with_destination(destination)
        .with_node_key(node)
        .with_sender(sender_names(packet, decoded))
        .with_meta(meta);
    if let Some(at) = rx_time(packet) {
        event = event.with_received_at(at);
    }
    Some(event)
}

/// `fromId`, else the numeric `from` rendered as `!%08x`.
fn from_id(packet: &Value) -> Option<String> {
    if let Some(id) = packet
        .get("fromId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return Some(id.to_string());
    }
    let num = int_field(packet.get("from"))?;
    let num = u32::try_from(num).ok()?;
    Some(format!("!{num:08x}"))
}

/// Missing destination counts as broadcast.
fn is_broadcast(packet: &Value) -> bool {
    if int_field(packet.get("to")) == Some(i64::from(BROADCAST_NUM)) {
        return true;
    }
    match packet.get("toId") {
        None | Some(Value::Null) => true,
        Some(Value::String(id)) => is_broadcast_id(id),
        Some(other) => is_broadcast_id(&other.to_string()),
    }
}

fn port_kind(decoded: &Value) -> EventKind {
    match decoded.get("portnum").and_then(Value::as_str) {
        Some("TELEMETRY_APP") => EventKind::Telemetry,
        Some("POSITION_APP") => EventKind::Position,
        _ => EventKind::Other,
    }
}

fn binary_payload(decoded: &Value) -> Payload {
    let bytes = decoded
        .get("payload")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|b| u8::try_from(b).ok())
                .collect()
        })
        .unwrap_or_default();
    Payload::Binary(bytes)
}

fn sender_names(packet: &Value, decoded: &Value) -> SenderNames {
    [decoded.get("user"), packet.get("user"), decoded.get("sender")]
        .into_iter()
        .flatten()
        .map(|user| {
            SenderNames::new(
                user.get("shortName").and_then(Value::as_str),
                user.get("longName").and_then(Value::as_str),
            )
        })
        .find(|names| !names.is_empty())
        .unwrap_or_default()
}

fn rx_time(packet: &Value) -> Option<DateTime<Utc>> {
    ["rxTime", "rx_time", "rxTimeSec"]
        .iter()
        .filter_map(|key| packet.get(*key).and_then(Value::as_f64))
        .find(|secs| *secs > 0.0)
        .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
}

/// Integers given as JSON numbers, decimal strings or `0x` hex strings.
fn int_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => i64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_packet_to_channel_event() {
        let frame = json!({
            "type": "packet",
            "packet": {
                "fromId": "!a1b2c3d4",
                "toId": "^all",
                "channel": 2,
                "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": "hello mesh"},
                "hopStart": 3,
                "hopLimit": 1,
                "rxTime": 1_700_000_000,
                "user": {"shortName": "AB", "longName": "Alice"}
            }
        })
        .to_string();

        let event = decode_frame(&frame, "roof").unwrap();
        assert_eq!(event.source_id, "!a1b2c3d4");
        assert_eq!(event.channel_id, 2);
        assert_eq!(event.text_body(), Some("hello mesh"));
        assert!(!event.is_direct());
        assert_eq!(event.node_key.as_deref(), Some("roof"));
        assert_eq!(event.sender.long.as_deref(), Some("Alice"));
        assert_eq!(event.meta.hops(), 2);
        assert_eq!(event.meta.via(), "LoRa");
        assert_eq!(event.received_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_numeric_ids_and_direct_message() {
        let packet = json!({
            "from": 0xbbfb_c373u32,
            "to": 0x1234,
            "toId": "!00001234",
            "decoded": {"text": "psst", "channel": "1"},
            "viaMqtt": true
        });
        let event = packet_to_event(&packet, "base").unwrap();
        assert_eq!(event.source_id, "!bbfbc373");
        assert_eq!(event.destination, Destination::Node("!00001234".into()));
        assert!(event.is_direct());
        assert_eq!(event.channel_id, 1);
        assert_eq!(event.meta.via(), "MQTT");
    }

    #[test]
    fn test_broadcast_spellings() {
        for packet in [
            json!({"fromId": "!a", "to": 4_294_967_295u64}),
            json!({"fromId": "!a", "toId": "!ffffffff"}),
            json!({"fromId": "!a"}),
        ] {
            assert!(!packet_to_event(&packet, "n").unwrap().is_direct());
        }
    }

    #[test]
    fn test_non_text_packets() {
        let packet = json!({
            "fromId": "!a",
            "decoded": {"portnum": "TELEMETRY_APP", "payload": [1, 2, 300]}
        });
        let event = packet_to_event(&packet, "n").unwrap();
        assert_eq!(event.kind, EventKind::Telemetry);
        assert_eq!(event.payload, Payload::Binary(vec![1, 2]));
        assert_eq!(event.text_body(), None);
    }

    #[test]
    fn test_frames_without_sender_are_dropped() {
        assert!(decode_frame(r#"{"type":"packet","packet":{"toId":"^all"}}"#, "n").is_none());
        assert!(decode_frame(r#"{"type":"status","connected":true}"#, "n").is_none());
        assert!(decode_frame("not json", "n").is_none());
    }

    #[test]
    fn test_send_text_frame_shape() {
        let frame = OutboundFrame::send_text(7, &OutboundMessage::direct("!b", "hi").on_channel(3));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "sendText", "id": 7, "text": "hi", "destinationId": "!b", "channelIndex": 3})
        );
    }
}
