//! Persistent records and the queries over them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{ConversationId, Direction, SenderNames};

/// Largest page a history query may request.
pub const MAX_HISTORY_PAGE: u32 = 1000;

// =============================================================================
// Stations and names
// =============================================================================

/// A node the bot has heard from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    /// Node id, unique.
    pub node_id: String,
    /// Current display name (long name, else short name).
    pub display_name: Option<String>,
    /// First time the node was heard.
    pub first_seen_at: DateTime<Utc>,
    /// Last time the node was heard.
    pub last_seen_at: DateTime<Utc>,
    /// Free-form metadata merged from packets (JSON object).
    pub metadata: serde_json::Value,
}

/// One observed name change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    /// Row id.
    pub id: i64,
    /// Node id.
    pub node_id: String,
    /// Short name at the time.
    pub short_name: Option<String>,
    /// Long name at the time.
    pub long_name: Option<String>,
    /// When the change was observed.
    pub changed_at: DateTime<Utc>,
}

/// Input to [`Store::upsert_station`](crate::Store::upsert_station).
#[derive(Debug, Clone)]
pub struct StationUpdate {
    /// Node id.
    pub node_id: String,
    /// Names advertised in this packet; empty names leave history untouched.
    pub names: SenderNames,
    /// When the node was heard.
    pub seen_at: DateTime<Utc>,
    /// Metadata keys to merge into the station's metadata object.
    pub metadata: Option<serde_json::Value>,
}

impl StationUpdate {
    /// A sighting with no names and no metadata.
    pub fn seen(node_id: impl Into<String>, seen_at: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            names: SenderNames::default(),
            seen_at,
            metadata: None,
        }
    }

    /// Attaches names.
    pub fn with_names(mut self, names: SenderNames) -> Self {
        self.names = names;
        self
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of a station upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct StationUpsert {
    /// The station after the write.
    pub station: Station,
    /// `true` if the station did not exist before.
    pub created: bool,
    /// `true` if a name history row was appended.
    pub name_changed: bool,
}

/// Station plus its name history, for user lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    /// The station.
    #[serde(flatten)]
    pub station: Station,
    /// Total number of name history rows.
    pub name_entries: u64,
    /// Name history, limited and ordered as requested.
    pub name_history: Vec<NameRecord>,
}

// =============================================================================
// Messages
// =============================================================================

/// A stored conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Row id; increases with insertion order.
    pub id: i64,
    /// Conversation key.
    pub conversation_id: ConversationId,
    /// Sending node for inbound messages; `None` for bot sends.
    pub sender_id: Option<String>,
    /// In or out.
    pub direction: Direction,
    /// Message text.
    pub body: String,
    /// Reception or send time.
    pub sent_at: DateTime<Utc>,
    /// Channel name at the time (`DM` for direct messages).
    pub channel_name: Option<String>,
    /// Radio node involved.
    pub node_key: Option<String>,
    /// Sender names at the time.
    #[serde(default)]
    pub sender: SenderNames,
}

/// Input to [`Store::append_message`](crate::Store::append_message).
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Conversation key.
    pub conversation_id: ConversationId,
    /// Sending node.
    pub sender_id: Option<String>,
    /// In or out.
    pub direction: Direction,
    /// Message text.
    pub body: String,
    /// Reception or send time.
    pub sent_at: DateTime<Utc>,
    /// Channel name at the time.
    pub channel_name: Option<String>,
    /// Radio node involved.
    pub node_key: Option<String>,
    /// Sender names at the time.
    pub sender: SenderNames,
}

impl NewMessage {
    /// A message with only the required fields set.
    pub fn new(
        conversation_id: ConversationId,
        direction: Direction,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id,
            sender_id: None,
            direction,
            body: body.into(),
            sent_at,
            channel_name: None,
            node_key: None,
            sender: SenderNames::default(),
        }
    }
}

/// Everything one inbound event writes, applied in a single transaction.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    /// Station sighting (and possibly a name change).
    pub station: StationUpdate,
    /// The message, for text events.
    pub message: Option<NewMessage>,
}

/// Result of [`Store::record_inbound`](crate::Store::record_inbound).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    /// Row id of the stored message.
    pub message_id: Option<i64>,
    /// Whether the name history grew.
    pub name_changed: bool,
}

// =============================================================================
// History queries
// =============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl SortOrder {
    /// Parses `asc`/`desc`, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    /// SQL keyword.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Column a history query sorts by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Row id (insertion order).
    #[default]
    Id,
    /// Message timestamp; also accepts `ts`.
    #[serde(alias = "ts")]
    SentAt,
}

impl SortKey {
    /// Parses `id`, `ts` or `sent_at`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" => Some(Self::Id),
            "ts" | "sent_at" => Some(Self::SentAt),
            _ => None,
        }
    }
}

/// A page request over one conversation's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Conversation to read.
    pub conversation_id: ConversationId,
    /// Page size; clamped to `1..=1000`.
    pub limit: u32,
    /// Sort direction.
    pub order: SortOrder,
    /// Sort column.
    pub sort_by: SortKey,
    /// Only rows with a smaller id.
    pub before_id: Option<i64>,
    /// Only rows with a larger id.
    pub after_id: Option<i64>,
    /// Only rows in this direction.
    pub direction: Option<Direction>,
}

impl HistoryQuery {
    /// Newest 100 messages of `conversation_id`, newest first.
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            limit: 100,
            order: SortOrder::Desc,
            sort_by: SortKey::Id,
            before_id: None,
            after_id: None,
            direction: None,
        }
    }

    /// Sets the page size.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the sort direction.
    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the sort column.
    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort_by = key;
        self
    }

    /// Only rows older than `id`.
    pub fn before(mut self, id: i64) -> Self {
        self.before_id = Some(id);
        self
    }

    /// Only rows newer than `id`.
    pub fn after(mut self, id: i64) -> Self {
        self.after_id = Some(id);
        self
    }

    /// Only rows in `direction`.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// The page size after clamping.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_HISTORY_PAGE)
    }
}

/// One page of history with cursors for the next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Messages, in the requested order.
    pub items: Vec<ConversationMessage>,
    /// For descending pages: pass as `before_id` to continue.
    pub next_before_id: Option<i64>,
    /// For ascending pages: pass as `after_id` to continue.
    pub next_after_id: Option<i64>,
}

impl HistoryPage {
    /// Builds a page and derives its cursor from the items.
    pub fn new(items: Vec<ConversationMessage>, order: SortOrder) -> Self {
        let ids = items.iter().map(|m| m.id);
        let (next_before_id, next_after_id) = match order {
            SortOrder::Desc => (ids.min(), None),
            SortOrder::Asc => (None, ids.max()),
        };
        Self {
            items,
            next_before_id,
            next_after_id,
        }
    }
}

/// Aggregate counts from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Distinct stations.
    pub station_count: u64,
    /// Stored messages across all conversations.
    pub message_count: u64,
    /// Name history rows.
    pub name_rows: u64,
    /// Stored inbound messages.
    pub rx_messages: u64,
    /// Stored outbound messages.
    pub tx_messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_query_limit_is_clamped() {
        let q = HistoryQuery::new(ConversationId::Channel(0)).limit(0);
        assert_eq!(q.effective_limit(), 1);
        assert_eq!(q.limit(5000).effective_limit(), MAX_HISTORY_PAGE);
    }

    #[test]
    fn test_page_cursor_follows_order() {
        let msg = |id| ConversationMessage {
            id,
            conversation_id: ConversationId::Channel(0),
            sender_id: None,
            direction: Direction::In,
            body: String::new(),
            sent_at: Utc::now(),
            channel_name: None,
            node_key: None,
            sender: SenderNames::default(),
        };
        let desc = HistoryPage::new(vec![msg(9), msg(7)], SortOrder::Desc);
        assert_eq!(desc.next_before_id, Some(7));
        assert_eq!(desc.next_after_id, None);
        let asc = HistoryPage::new(vec![msg(3), msg(4)], SortOrder::Asc);
        assert_eq!(asc.next_after_id, Some(4));
        assert_eq!(HistoryPage::new(vec![], SortOrder::Desc).next_before_id, None);
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!(SortOrder::parse("ASC"), Some(SortOrder::Asc));
        assert_eq!(SortKey::parse("ts"), Some(SortKey::SentAt));
        assert_eq!(SortKey::parse("name"), None);
    }
}
