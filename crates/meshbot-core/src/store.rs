//! The persistence contract.
//!
//! The store is the only owner of durable state. Every mutating method is
//! atomic: implementations must apply it as one transaction so concurrent
//! producers never observe or create partial writes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::event::{ConversationId, SenderNames};
use crate::record::{
    ConversationMessage, HistoryPage, HistoryQuery, InboundRecord, NewMessage, RecordOutcome,
    SortOrder, StationInfo, StationUpdate, StationUpsert, StoreStats,
};

/// Durable storage for stations, name history and bounded conversation history.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Inserts or refreshes a station, appending a name history row when the
    /// advertised names differ from the latest recorded ones.
    async fn upsert_station(&self, update: StationUpdate) -> StoreResult<StationUpsert>;

    /// Appends a name history row unless `names` equals the latest row.
    /// Returns whether a row was appended.
    async fn append_name_history(
        &self,
        node_id: &str,
        names: &SenderNames,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Appends a message and evicts the oldest messages of its conversation
    /// beyond the configured limit, in the same transaction.
    async fn append_message(&self, message: NewMessage) -> StoreResult<i64>;

    /// Applies the station upsert and the message append of one inbound event
    /// as a single transaction.
    async fn record_inbound(&self, record: InboundRecord) -> StoreResult<RecordOutcome>;

    /// The newest `limit` messages of a conversation, oldest first.
    async fn read_history(
        &self,
        conversation: &ConversationId,
        limit: u32,
    ) -> StoreResult<Vec<ConversationMessage>>;

    /// A paging query over one conversation.
    async fn query_history(&self, query: &HistoryQuery) -> StoreResult<HistoryPage>;

    /// Station details and name history, or `None` for an unknown node.
    async fn station_info(
        &self,
        node_id: &str,
        name_limit: u32,
        name_order: SortOrder,
    ) -> StoreResult<Option<StationInfo>>;

    /// The most recently recorded names of a node.
    async fn latest_names(&self, node_id: &str) -> StoreResult<Option<SenderNames>>;

    /// Aggregate counts.
    async fn read_stats(&self) -> StoreResult<StoreStats>;

    /// Flushes and releases the store. Later calls fail with `StoreError::Closed`.
    async fn close(&self) -> StoreResult<()>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn Store>;
