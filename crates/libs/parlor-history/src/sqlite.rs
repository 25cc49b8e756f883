use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use parlor_message::{HistoryId, MessageContent, MessageRecord};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::HistoryStoreError;
use crate::meta::HistoryMetaStorage;
use crate::store::{HistoryStore, HistoryStoreEvent};

/// rusqlite-backed history cache. One connection, serialized behind a
/// mutex; statements are short and the session drives the store from a
/// single context anyway.
///
/// Also implements [`HistoryMetaStorage`]: the revision cursor lives in
/// the same database file as the messages it describes.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS history (
                db_key TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                content TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS history_timestamp ON history (timestamp);
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
    }

    fn meta_get(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .unwrap_or_else(|err| {
                log::warn!("meta read for '{key}' failed: {err}");
                None
            })
    }

    fn meta_set(&self, key: &str, value: Option<&str>) {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let result = match value {
            Some(value) => conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            ),
            None => conn.execute("DELETE FROM meta WHERE key = ?1", params![key]),
        };
        if let Err(err) = result {
            log::warn!("meta write for '{key}' failed: {err}");
        }
    }
}

fn row_to_record(
    db_key: String,
    message_id: String,
    timestamp: i64,
    content: String,
) -> Result<MessageRecord, HistoryStoreError> {
    let content: MessageContent = serde_json::from_str(&content)?;
    Ok(MessageRecord::history(message_id.as_str(), HistoryId::new(db_key, timestamp), content))
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn latest(&self, limit: usize) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT db_key, message_id, timestamp, content FROM history
             ORDER BY timestamp DESC, db_key DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;

        let mut page = Vec::new();
        for row in rows {
            let (db_key, message_id, timestamp, content) = row?;
            page.push(row_to_record(db_key, message_id, timestamp, content)?);
        }
        page.reverse();
        Ok(page)
    }

    async fn before(
        &self,
        before: &HistoryId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT db_key, message_id, timestamp, content FROM history
             WHERE timestamp < ?1 OR (timestamp = ?1 AND db_key < ?2)
             ORDER BY timestamp DESC, db_key DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![before.timestamp_micros, before.db_key, limit as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let mut page = Vec::new();
        for row in rows {
            let (db_key, message_id, timestamp, content) = row?;
            page.push(row_to_record(db_key, message_id, timestamp, content)?);
        }
        page.reverse();
        Ok(page)
    }

    async fn all(&self) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT db_key, message_id, timestamp, content FROM history
             ORDER BY timestamp ASC, db_key ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;

        let mut messages = Vec::new();
        for row in rows {
            let (db_key, message_id, timestamp, content) = row?;
            messages.push(row_to_record(db_key, message_id, timestamp, content)?);
        }
        Ok(messages)
    }

    async fn insert_or_update(
        &self,
        messages: &[MessageRecord],
    ) -> Result<Vec<HistoryStoreEvent>, HistoryStoreError> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let mut events = Vec::new();

        for message in messages {
            let history_id = message
                .history_id()
                .ok_or_else(|| HistoryStoreError::MissingHistoryId(message.id().to_string()))?;
            let content = serde_json::to_string(message.content())?;

            let existing: Option<(i64, String)> = conn
                .query_row(
                    "SELECT timestamp, content FROM history WHERE db_key = ?1",
                    params![history_id.db_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((old_ts, old_content)) => {
                    if old_ts == history_id.timestamp_micros && old_content == content {
                        continue;
                    }
                    conn.execute(
                        "UPDATE history SET message_id = ?2, timestamp = ?3, content = ?4
                         WHERE db_key = ?1",
                        params![
                            history_id.db_key,
                            message.id().as_str(),
                            history_id.timestamp_micros,
                            content
                        ],
                    )?;
                    events.push(HistoryStoreEvent::Changed { message: message.clone() });
                }
                None => {
                    let prev: Option<(String, i64)> = conn
                        .query_row(
                            "SELECT db_key, timestamp FROM history
                             WHERE timestamp < ?1 OR (timestamp = ?1 AND db_key < ?2)
                             ORDER BY timestamp DESC, db_key DESC LIMIT 1",
                            params![history_id.timestamp_micros, history_id.db_key],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?;
                    conn.execute(
                        "INSERT INTO history (db_key, message_id, timestamp, content)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            history_id.db_key,
                            message.id().as_str(),
                            history_id.timestamp_micros,
                            content
                        ],
                    )?;
                    events.push(HistoryStoreEvent::Added {
                        message: message.clone(),
                        prev: prev.map(|(db_key, ts)| HistoryId::new(db_key, ts)),
                    });
                }
            }
        }

        Ok(events)
    }

    async fn delete(
        &self,
        db_keys: &HashSet<String>,
    ) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let mut removed = Vec::new();

        for db_key in db_keys {
            let existing: Option<(String, i64, String)> = conn
                .query_row(
                    "SELECT message_id, timestamp, content FROM history WHERE db_key = ?1",
                    params![db_key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            if let Some((message_id, timestamp, content)) = existing {
                conn.execute("DELETE FROM history WHERE db_key = ?1", params![db_key])?;
                removed.push(row_to_record(db_key.clone(), message_id, timestamp, content)?);
            }
        }

        Ok(removed)
    }

    async fn clear(&self) -> Result<(), HistoryStoreError> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute("DELETE FROM history", [])?;
        Ok(())
    }
}

impl HistoryMetaStorage for SqliteHistoryStore {
    fn revision(&self) -> Option<String> {
        self.meta_get("revision")
    }

    fn set_revision(&self, revision: Option<String>) {
        self.meta_set("revision", revision.as_deref());
    }

    fn is_history_ended(&self) -> bool {
        self.meta_get("history_ended").as_deref() == Some("1")
    }

    fn set_history_ended(&self) {
        self.meta_set("history_ended", Some("1"));
    }
}
