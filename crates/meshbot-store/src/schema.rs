//! Schema migrations, tracked through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::{debug, info};

/// Ordered migrations. Index `i` upgrades the schema from version `i` to `i + 1`.
const MIGRATIONS: &[&str] = &[
    // v1: stations, name history, bounded conversation history.
    r#"
    CREATE TABLE IF NOT EXISTS stations (
        node_id TEXT PRIMARY KEY,
        display_name TEXT,
        first_seen_ms INTEGER NOT NULL,
        last_seen_ms INTEGER NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    );

    CREATE TABLE IF NOT EXISTS names (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        short_name TEXT,
        long_name TEXT,
        changed_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_names_node ON names(node_id, changed_at_ms, id);

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        conversation_type TEXT NOT NULL,
        channel INTEGER,
        peer_id TEXT,
        channel_name TEXT,
        sender_id TEXT,
        short_name TEXT,
        long_name TEXT,
        node_key TEXT,
        direction TEXT NOT NULL CHECK (direction IN ('in', 'out')),
        body TEXT NOT NULL,
        sent_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, sent_at_ms, id);
    "#,
];

/// Current schema version.
pub const SCHEMA_VERSION: usize = MIGRATIONS.len();

/// Applies pending migrations, each in its own transaction.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    let current: usize = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    debug!(current, target = SCHEMA_VERSION, "Checking store schema");

    for (version, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        info!(version = version + 1, "Applied store migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: usize = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                 AND name IN ('stations', 'names', 'messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
