//! [`Store`] implementation over a pooled SQLite database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use meshbot_core::{
    ConversationId, ConversationMessage, HistoryPage, HistoryQuery, InboundRecord, NewMessage,
    RecordOutcome, SenderNames, SortOrder, StationInfo, StationUpdate, StationUpsert, Store,
    StoreError, StoreResult, StoreStats,
};

use crate::ops;
use crate::schema;

/// Tuning for a [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Messages kept per conversation.
    pub history_limit: u32,
    /// How long a writer waits for the database lock.
    pub busy_timeout: Duration,
    /// Maximum pooled connections.
    pub pool_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
            busy_timeout: Duration::from_secs(5),
            pool_size: 4,
        }
    }
}

impl StoreOptions {
    /// Sets the per-conversation history limit.
    pub fn history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit;
        self
    }
}

/// SQLite-backed store.
///
/// Writers use `BEGIN IMMEDIATE`, so concurrent producers serialize on the
/// database write lock (waiting up to `busy_timeout`) while WAL mode lets
/// readers proceed. All SQLite calls run on the blocking thread pool.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    options: StoreOptions,
    path: Option<PathBuf>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies migrations.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StoreError::unavailable)?;
        }

        let busy = options.busy_timeout;
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            conn.busy_timeout(busy)
        });
        let store = Self::with_manager(manager, options, Some(path))?;

        info!(
            path = ?store.path,
            history_limit = store.options.history_limit,
            "Store opened"
        );
        Ok(store)
    }

    /// Opens a private in-memory database. Uses a single connection so every
    /// caller sees the same data.
    pub fn open_in_memory(options: StoreOptions) -> StoreResult<Self> {
        let options = StoreOptions {
            pool_size: 1,
            ..options
        };
        Self::with_manager(SqliteConnectionManager::memory(), options, None)
    }

    fn with_manager(
        manager: SqliteConnectionManager,
        options: StoreOptions,
        path: Option<PathBuf>,
    ) -> StoreResult<Self> {
        // An in-memory database lives only as long as its connection.
        let lifetime = path.as_ref().map(|_| Duration::from_secs(30 * 60));
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .idle_timeout(lifetime)
            .max_lifetime(lifetime)
            .build(manager)
            .map_err(StoreError::unavailable)?;

        {
            let mut conn = pool.get().map_err(StoreError::unavailable)?;
            schema::migrate(&mut conn).map_err(StoreError::transaction)?;
        }

        Ok(Self {
            pool,
            options,
            path,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The configured options.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Runs `f` with a pooled connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(StoreError::unavailable)?;
            f(&mut *conn).map_err(StoreError::transaction)
        })
        .await
        .map_err(|e| StoreError::Transaction(format!("store task failed: {e}")))?
    }

    /// Runs `f` inside one `IMMEDIATE` transaction.
    async fn write<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_station(&self, update: StationUpdate) -> StoreResult<StationUpsert> {
        self.write(move |conn| ops::upsert_station(conn, &update))
            .await
    }

    async fn append_name_history(
        &self,
        node_id: &str,
        names: &SenderNames,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let node_id = node_id.to_string();
        let names = names.clone();
        self.write(move |conn| ops::append_name(conn, &node_id, &names, changed_at))
            .await
    }

    async fn append_message(&self, message: NewMessage) -> StoreResult<i64> {
        let keep = self.options.history_limit;
        self.write(move |conn| ops::insert_message(conn, &message, keep))
            .await
    }

    async fn record_inbound(&self, record: InboundRecord) -> StoreResult<RecordOutcome> {
        let keep = self.options.history_limit;
        let outcome = self
            .write(move |conn| {
                let upsert = ops::upsert_station(conn, &record.station)?;
                let message_id = record
                    .message
                    .as_ref()
                    .map(|m| ops::insert_message(conn, m, keep))
                    .transpose()?;
                Ok(RecordOutcome {
                    message_id,
                    name_changed: upsert.name_changed,
                })
            })
            .await?;
        debug!(
            message_id = ?outcome.message_id,
            name_changed = outcome.name_changed,
            "Recorded inbound event"
        );
        Ok(outcome)
    }

    async fn read_history(
        &self,
        conversation: &ConversationId,
        limit: u32,
    ) -> StoreResult<Vec<ConversationMessage>> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| ops::recent_messages(conn, &conversation, limit))
            .await
    }

    async fn query_history(&self, query: &HistoryQuery) -> StoreResult<HistoryPage> {
        let query = query.clone();
        let order = query.order;
        let items = self
            .with_conn(move |conn| ops::query_messages(conn, &query))
            .await?;
        Ok(HistoryPage::new(items, order))
    }

    async fn station_info(
        &self,
        node_id: &str,
        name_limit: u32,
        name_order: SortOrder,
    ) -> StoreResult<Option<StationInfo>> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| ops::station_info(conn, &node_id, name_limit, name_order))
            .await
    }

    async fn latest_names(&self, node_id: &str) -> StoreResult<Option<SenderNames>> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| ops::latest_names(conn, &node_id))
            .await
    }

    async fn read_stats(&self) -> StoreResult<StoreStats> {
        self.with_conn(|conn| ops::stats(conn)).await
    }

    async fn close(&self) -> StoreResult<()> {
        if self.path.is_some() {
            let result = self
                .with_conn(|conn| conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);"))
                .await;
            if let Err(e) = result {
                warn!(error = %e, "WAL checkpoint on close failed");
            }
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use futures::future::join_all;
    use meshbot_core::{Direction, SenderNames};

    fn open(dir: &tempfile::TempDir, limit: u32) -> Arc<SqliteStore> {
        let path = dir.path().join("nested").join("bot.db");
        Arc::new(SqliteStore::open(path, StoreOptions::default().history_limit(limit)).unwrap())
    }

    fn inbound(node: &str, conv: ConversationId, body: &str, at: DateTime<Utc>) -> InboundRecord {
        let mut message = NewMessage::new(conv, Direction::In, body, at);
        message.sender_id = Some(node.to_string());
        InboundRecord {
            station: StationUpdate::seen(node, at).with_names(SenderNames::new(Some(node), None)),
            message: Some(message),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_respect_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, 5);
        let conv = ConversationId::Channel(0);
        let base = Utc::now();

        let writes = (0..40).map(|i| {
            let store = Arc::clone(&store);
            let conv = conv.clone();
            tokio::spawn(async move {
                let at = base + ChronoDuration::milliseconds(i);
                store
                    .record_inbound(inbound("!n", conv, &format!("m{i}"), at))
                    .await
            })
        });
        for result in join_all(writes).await {
            result.unwrap().unwrap();
        }

        let history = store.read_history(&conv, 100).await.unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m35", "m36", "m37", "m38", "m39"]);

        let stats = store.read_stats().await.unwrap();
        assert_eq!(stats.station_count, 1);
        assert_eq!(stats.name_rows, 1);
    }

    #[tokio::test]
    async fn test_record_inbound_without_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, 10);
        let outcome = store
            .record_inbound(InboundRecord {
                station: StationUpdate::seen("!t", Utc::now()),
                message: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.message_id, None);

        let info = store.station_info("!t", 10, SortOrder::Desc).await.unwrap();
        assert!(info.is_some());
        assert_eq!(store.read_stats().await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let conv = ConversationId::Direct("!p".into());
        {
            let store = open(&dir, 10);
            store
                .record_inbound(inbound("!p", conv.clone(), "hello", Utc::now()))
                .await
                .unwrap();
            store.close().await.unwrap();
        }
        let store = open(&dir, 10);
        let history = store.read_history(&conv, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hello");
        assert_eq!(history[0].sender.short.as_deref(), Some("!p"));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = SqliteStore::open_in_memory(StoreOptions::default()).unwrap();
        store.close().await.unwrap();
        let err = store.read_stats().await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[tokio::test]
    async fn test_unknown_station_is_none() {
        let store = SqliteStore::open_in_memory(StoreOptions::default()).unwrap();
        assert!(
            store
                .station_info("!nobody", 10, SortOrder::Desc)
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.latest_names("!nobody").await.unwrap().is_none());
    }
}
