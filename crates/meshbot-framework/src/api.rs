//! Facade the HTTP layer talks to.
//!
//! Every send goes through the [`Dispatcher`], so API messages are split,
//! persisted and seen by plugins exactly like command replies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use meshbot_core::{
    HistoryPage, HistoryQuery, OutboundMessage, Origin, SendResult, SortOrder, StationInfo,
    StoreResult,
};

use crate::dispatcher::Dispatcher;
use crate::stats::StatsSnapshot;

/// Largest name history an API caller may request.
pub const MAX_NAME_LIMIT: u32 = 500;

/// What an API token may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiScope {
    /// Read endpoints only.
    Read,
    /// Read and send.
    #[default]
    Send,
}

impl ApiScope {
    /// Whether this scope may send messages.
    pub fn allows_send(&self) -> bool {
        matches!(self, Self::Send)
    }
}

/// Read and send operations exposed to external callers.
#[derive(Clone)]
pub struct ApiFacade {
    dispatcher: Arc<Dispatcher>,
}

impl ApiFacade {
    /// Creates a facade over `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Sends a message on behalf of an API caller.
    pub async fn send(&self, message: OutboundMessage) -> SendResult {
        self.dispatcher.send(message, Origin::Api).await
    }

    /// One page of a conversation's history.
    pub async fn get_history(&self, query: &HistoryQuery) -> StoreResult<HistoryPage> {
        self.dispatcher.store().query_history(query).await
    }

    /// Store counts plus live dispatcher counters.
    pub async fn get_stats(&self) -> StoreResult<StatsSnapshot> {
        StatsSnapshot::collect(self.dispatcher.store().as_ref(), self.dispatcher.counters()).await
    }

    /// Station details with up to `name_limit` name history rows.
    ///
    /// `name_limit` is clamped to `1..=500`.
    pub async fn get_user_info(
        &self,
        node_id: &str,
        name_limit: u32,
        order: SortOrder,
    ) -> StoreResult<Option<StationInfo>> {
        let limit = name_limit.clamp(1, MAX_NAME_LIMIT);
        self.dispatcher
            .store()
            .station_info(node_id.trim(), limit, order)
            .await
    }

    /// Names of the radio nodes sends can be routed through.
    pub fn nodes(&self) -> Vec<String> {
        self.dispatcher.radio_nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use meshbot_core::{
        ConversationId, Direction, InboundEvent, RadioTransport, SendReceipt, SendStatus,
        SenderNames, SharedStore, TransportResult,
    };
    use meshbot_store::{SqliteStore, StoreOptions};

    struct Loopback;

    #[async_trait]
    impl RadioTransport for Loopback {
        fn name(&self) -> &str {
            "loopback"
        }

        async fn send(&self, _message: &OutboundMessage) -> TransportResult<SendReceipt> {
            Ok(SendReceipt::queued(None))
        }

        fn nodes(&self) -> Vec<String> {
            vec!["roof".to_string()]
        }
    }

    fn facade() -> (ApiFacade, Arc<Dispatcher>) {
        let store: SharedStore =
            Arc::new(SqliteStore::open_in_memory(StoreOptions::default()).unwrap());
        let dispatcher = Arc::new(Dispatcher::builder(store, Arc::new(Loopback)).build());
        (ApiFacade::new(Arc::clone(&dispatcher)), dispatcher)
    }

    #[test]
    fn test_scope() {
        assert!(ApiScope::Send.allows_send());
        assert!(!ApiScope::Read.allows_send());
        let scope: ApiScope = serde_json::from_str("\"read\"").unwrap();
        assert_eq!(scope, ApiScope::Read);
    }

    #[tokio::test]
    async fn test_send_then_read_history() {
        let (api, _) = facade();
        let result = api.send(OutboundMessage::direct("!peer", "hello")).await;
        assert_eq!(result.status, SendStatus::Queued);
        assert_eq!(api.nodes(), ["roof"]);

        let page = api
            .get_history(&HistoryQuery::new(ConversationId::Direct("!peer".into())))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].direction, Direction::Out);

        let stats = api.get_stats().await.unwrap();
        assert_eq!(stats.tx_messages, 1);
        assert_eq!(stats.message_count, 1);
    }

    #[tokio::test]
    async fn test_user_info_clamps_limit() {
        let (api, dispatcher) = facade();
        let base = Utc::now();
        for (i, short) in ["A", "B", "C"].iter().enumerate() {
            let event = InboundEvent::text("!n1", 0, "hi")
                .with_sender(SenderNames::new(Some(short), None))
                .with_received_at(base + Duration::seconds(i as i64));
            dispatcher.submit(event).await.unwrap();
        }

        let info = api.get_user_info("!n1", 0, SortOrder::Desc).await.unwrap().unwrap();
        assert_eq!(info.name_entries, 3);
        assert_eq!(info.name_history.len(), 1);
        assert_eq!(info.name_history[0].short_name.as_deref(), Some("C"));

        let all = api.get_user_info(" !n1 ", 9999, SortOrder::Asc).await.unwrap().unwrap();
        assert_eq!(all.name_history.len(), 3);
        assert_eq!(all.name_history[0].short_name.as_deref(), Some("A"));

        assert!(api.get_user_info("!nobody", 10, SortOrder::Desc).await.unwrap().is_none());
    }
}
