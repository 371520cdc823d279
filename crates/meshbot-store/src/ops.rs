//! Synchronous SQL operations.
//!
//! Every function takes a plain `&Connection` so the caller decides the
//! transaction boundary; [`SqliteStore`](crate::SqliteStore) wraps each public
//! operation in one `IMMEDIATE` transaction.

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};

use meshbot_core::{
    ConversationId, ConversationMessage, Direction, HistoryQuery, NameRecord, NewMessage,
    SenderNames, SortKey, SortOrder, Station, StationInfo, StationUpdate, StationUpsert,
    StoreStats,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, direction, body, sent_at_ms, \
                               channel_name, node_key, short_name, long_name";

// =============================================================================
// Row decoding
// =============================================================================

fn ts(ms: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn station_from_row(row: &Row<'_>) -> rusqlite::Result<Station> {
    let metadata: String = row.get(4)?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Station {
        node_id: row.get(0)?,
        display_name: row.get(1)?,
        first_seen_at: ts(row.get(2)?, 2)?,
        last_seen_at: ts(row.get(3)?, 3)?,
        metadata,
    })
}

fn name_from_row(row: &Row<'_>) -> rusqlite::Result<NameRecord> {
    Ok(NameRecord {
        id: row.get(0)?,
        node_id: row.get(1)?,
        short_name: row.get(2)?,
        long_name: row.get(3)?,
        changed_at: ts(row.get(4)?, 4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationMessage> {
    let conversation: String = row.get(1)?;
    let conversation_id = conversation
        .parse::<ConversationId>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let direction: String = row.get(3)?;
    let direction = Direction::parse(&direction).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown direction '{direction}'").into(),
        )
    })?;
    let short: Option<String> = row.get(8)?;
    let long: Option<String> = row.get(9)?;

    Ok(ConversationMessage {
        id: row.get(0)?,
        conversation_id,
        sender_id: row.get(2)?,
        direction,
        body: row.get(4)?,
        sent_at: ts(row.get(5)?, 5)?,
        channel_name: row.get(6)?,
        node_key: row.get(7)?,
        sender: SenderNames::new(short.as_deref(), long.as_deref()),
    })
}

// =============================================================================
// Stations and names
// =============================================================================

pub(crate) fn get_station(conn: &Connection, node_id: &str) -> rusqlite::Result<Option<Station>> {
    conn.query_row(
        "SELECT node_id, display_name, first_seen_ms, last_seen_ms, metadata \
         FROM stations WHERE node_id = ?1",
        params![node_id],
        station_from_row,
    )
    .optional()
}

/// Shallow-merges `patch` into `base` when both are objects.
fn merge_metadata(base: Value, patch: Option<&Value>) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Some(Value::Object(patch))) => {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (_, Some(patch)) if patch.is_object() => patch.clone(),
        (base, _) if base.is_object() => base,
        _ => Value::Object(Map::new()),
    }
}

pub(crate) fn upsert_station(
    conn: &Connection,
    update: &StationUpdate,
) -> rusqlite::Result<StationUpsert> {
    let seen_ms = update.seen_at.timestamp_millis();
    let existing = get_station(conn, &update.node_id)?;
    let created = existing.is_none();

    match existing {
        None => {
            let metadata = merge_metadata(Value::Object(Map::new()), update.metadata.as_ref());
            conn.execute(
                "INSERT INTO stations (node_id, display_name, first_seen_ms, last_seen_ms, metadata) \
                 VALUES (?1, ?2, ?3, ?3, ?4)",
                params![
                    update.node_id,
                    update.names.display(),
                    seen_ms,
                    metadata.to_string()
                ],
            )?;
        }
        Some(station) => {
            let display = update
                .names
                .display()
                .map(str::to_string)
                .or(station.display_name);
            let metadata = merge_metadata(station.metadata, update.metadata.as_ref());
            conn.execute(
                "UPDATE stations SET display_name = ?2, \
                 last_seen_ms = MAX(last_seen_ms, ?3), \
                 first_seen_ms = MIN(first_seen_ms, ?3), metadata = ?4 \
                 WHERE node_id = ?1",
                params![update.node_id, display, seen_ms, metadata.to_string()],
            )?;
        }
    }

    let name_changed = append_name(conn, &update.node_id, &update.names, update.seen_at)?;
    let station = get_station(conn, &update.node_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;

    Ok(StationUpsert {
        station,
        created,
        name_changed,
    })
}

pub(crate) fn latest_names(
    conn: &Connection,
    node_id: &str,
) -> rusqlite::Result<Option<SenderNames>> {
    conn.query_row(
        "SELECT short_name, long_name FROM names WHERE node_id = ?1 \
         ORDER BY changed_at_ms DESC, id DESC LIMIT 1",
        params![node_id],
        |row| {
            let short: Option<String> = row.get(0)?;
            let long: Option<String> = row.get(1)?;
            Ok(SenderNames::new(short.as_deref(), long.as_deref()))
        },
    )
    .optional()
}

/// Appends a row when `names` differs from the latest one. Empty names never count.
pub(crate) fn append_name(
    conn: &Connection,
    node_id: &str,
    names: &SenderNames,
    changed_at: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    if names.is_empty() {
        return Ok(false);
    }
    if latest_names(conn, node_id)?.as_ref() == Some(names) {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO names (node_id, short_name, long_name, changed_at_ms) VALUES (?1, ?2, ?3, ?4)",
        params![
            node_id,
            names.short,
            names.long,
            changed_at.timestamp_millis()
        ],
    )?;
    Ok(true)
}

pub(crate) fn station_info(
    conn: &Connection,
    node_id: &str,
    name_limit: u32,
    order: SortOrder,
) -> rusqlite::Result<Option<StationInfo>> {
    let Some(station) = get_station(conn, node_id)? else {
        return Ok(None);
    };

    let name_entries: u64 = conn.query_row(
        "SELECT COUNT(*) FROM names WHERE node_id = ?1",
        params![node_id],
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT id, node_id, short_name, long_name, changed_at_ms FROM names \
         WHERE node_id = ?1 ORDER BY changed_at_ms {ord}, id {ord} LIMIT ?2",
        ord = order.as_sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let name_history = stmt
        .query_map(params![node_id, name_limit.max(1)], name_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(StationInfo {
        station,
        name_entries,
        name_history,
    }))
}

// =============================================================================
// Messages
// =============================================================================

/// Inserts `message` and trims its conversation to the newest `keep` rows.
pub(crate) fn insert_message(
    conn: &Connection,
    message: &NewMessage,
    keep: u32,
) -> rusqlite::Result<i64> {
    let conversation = &message.conversation_id;
    conn.execute(
        "INSERT INTO messages (conversation_id, conversation_type, channel, peer_id, channel_name, \
         sender_id, short_name, long_name, node_key, direction, body, sent_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            conversation.to_string(),
            conversation.kind(),
            conversation.channel(),
            conversation.peer(),
            message.channel_name,
            message.sender_id,
            message.sender.short,
            message.sender.long,
            message.node_key,
            message.direction.as_str(),
            message.body,
            message.sent_at.timestamp_millis(),
        ],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        "DELETE FROM messages WHERE conversation_id = ?1 AND id NOT IN ( \
             SELECT id FROM messages WHERE conversation_id = ?1 \
             ORDER BY sent_at_ms DESC, id DESC LIMIT ?2)",
        params![conversation.to_string(), keep.max(1)],
    )?;

    Ok(id)
}

/// Newest `limit` messages, returned oldest first.
pub(crate) fn recent_messages(
    conn: &Connection,
    conversation: &ConversationId,
    limit: u32,
) -> rusqlite::Result<Vec<ConversationMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
         ORDER BY sent_at_ms DESC, id DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut items = stmt
        .query_map(params![conversation.to_string(), limit.max(1)], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    items.reverse();
    Ok(items)
}

pub(crate) fn query_messages(
    conn: &Connection,
    query: &HistoryQuery,
) -> rusqlite::Result<Vec<ConversationMessage>> {
    let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?");
    let mut args: Vec<SqlValue> = vec![SqlValue::Text(query.conversation_id.to_string())];

    if let Some(before) = query.before_id {
        sql.push_str(" AND id < ?");
        args.push(SqlValue::Integer(before));
    }
    if let Some(after) = query.after_id {
        sql.push_str(" AND id > ?");
        args.push(SqlValue::Integer(after));
    }
    if let Some(direction) = query.direction {
        sql.push_str(" AND direction = ?");
        args.push(SqlValue::Text(direction.as_str().to_string()));
    }

    let column = match query.sort_by {
        SortKey::Id => "id",
        SortKey::SentAt => "sent_at_ms",
    };
    let ord = query.order.as_sql();
    sql.push_str(&format!(" ORDER BY {column} {ord}, id {ord} LIMIT ?"));
    args.push(SqlValue::Integer(i64::from(query.effective_limit())));

    let mut stmt = conn.prepare(&sql)?;
    stmt.query_map(params_from_iter(args), message_from_row)?
        .collect()
}

pub(crate) fn stats(conn: &Connection) -> rusqlite::Result<StoreStats> {
    conn.query_row(
        "SELECT \
           (SELECT COUNT(*) FROM stations), \
           (SELECT COUNT(*) FROM messages), \
           (SELECT COUNT(*) FROM names), \
           (SELECT COUNT(*) FROM messages WHERE direction = 'in'), \
           (SELECT COUNT(*) FROM messages WHERE direction = 'out')",
        [],
        |row| {
            Ok(StoreStats {
                station_count: row.get(0)?,
                message_count: row.get(1)?,
                name_rows: row.get(2)?,
                rx_messages: row.get(3)?,
                tx_messages: row.get(4)?,
            })
        },
    )
}
