//! Append-only message history per thread.
//!
//! Each stored message carries the full list of reminder snapshots the
//! intent extractor produced for it. Rows are never edited; a redelivered
//! message replaces its own row with identical content.

use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::reminder::{Reminder, ThreadKey};

mod schema;

use schema::THREAD_STORE_SCHEMA;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub message_id: String,
    pub thread_key: ThreadKey,
    pub email_date: DateTime<FixedOffset>,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

/// Get/query/put boundary of the key-value persistence engine.
pub trait ThreadStore {
    fn put_message(&self, message: &StoredMessage) -> Result<(), ThreadStoreError>;
    /// Messages of one thread, newest email date first.
    fn messages_by_thread_key(&self, key: &ThreadKey)
        -> Result<Vec<StoredMessage>, ThreadStoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteThreadStore {
    path: PathBuf,
}

impl SqliteThreadStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ThreadStoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, ThreadStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(THREAD_STORE_SCHEMA)?;
        Ok(conn)
    }
}

impl ThreadStore for SqliteThreadStore {
    fn put_message(&self, message: &StoredMessage) -> Result<(), ThreadStoreError> {
        let conn = self.open()?;
        let reminders_json = serde_json::to_string(&message.reminders)?;
        conn.execute(
            "INSERT INTO thread_messages (owner, thread_id, message_id, email_date, email_date_epoch, reminders_json, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(owner, thread_id, message_id) DO UPDATE SET
                email_date = excluded.email_date,
                email_date_epoch = excluded.email_date_epoch,
                reminders_json = excluded.reminders_json",
            params![
                message.thread_key.owner,
                message.thread_key.thread_id,
                message.message_id,
                message.email_date.to_rfc3339(),
                message.email_date.timestamp(),
                reminders_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn messages_by_thread_key(
        &self,
        key: &ThreadKey,
    ) -> Result<Vec<StoredMessage>, ThreadStoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, email_date, reminders_json
             FROM thread_messages
             WHERE owner = ?1 AND thread_id = ?2
             ORDER BY email_date_epoch DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![key.owner, key.thread_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (message_id, email_date_raw, reminders_json) = row?;
            messages.push(StoredMessage {
                message_id,
                thread_key: key.clone(),
                email_date: DateTime::parse_from_rfc3339(&email_date_raw)?,
                reminders: serde_json::from_str(&reminders_json)?,
            });
        }
        Ok(messages)
    }
}
