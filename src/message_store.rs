//! Message Storage
//!
//! Append-only per-conversation message log. A message is persisted here
//! before the relay attempts live delivery; offline recipients read their
//! history back through the pull path.
//! Supports both in-memory (for testing) and SQLite (for production).

use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::identity::Identity;

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message ID assigned by the store.
    pub id: String,
    pub sender_id: Identity,
    pub receiver_id: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Durable URL of an uploaded image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: &Identity, b: &Identity) -> bool {
        (&self.sender_id == a && &self.receiver_id == b)
            || (&self.sender_id == b && &self.receiver_id == a)
    }
}

/// A message as submitted by its sender, before persistence.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Identity,
    pub receiver_id: Identity,
    pub text: Option<String>,
    pub image: Option<String>,
}

impl NewMessage {
    fn into_stored(self) -> ChatMessage {
        // Millisecond precision so both backends return identical timestamps.
        let now = Utc::now();
        let created_at = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);

        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            text: self.text,
            image: self.image,
            created_at,
        }
    }
}

/// Trait for message storage backends.
pub trait MessageStore: Send + Sync {
    /// Durably stores a message and returns the stored record.
    fn persist(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Returns up to `limit` most recent messages exchanged between `a` and
    /// `b` (either direction), oldest first.
    fn conversation(
        &self,
        a: &Identity,
        b: &Identity,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Returns the total number of stored messages.
    fn message_count(&self) -> usize;
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

/// In-memory message log in insertion order.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    fn persist(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let stored = message.into_stored();
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stored.clone());
        Ok(stored)
    }

    fn conversation(
        &self,
        a: &Identity,
        b: &Identity,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut recent: Vec<ChatMessage> = messages
            .iter()
            .rev()
            .filter(|m| m.is_between(a, b))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    fn message_count(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent message log.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;

        // seq gives a total insertion order independent of clock resolution
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                text TEXT,
                image TEXT,
                created_at_ms INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair
             ON messages(sender_id, receiver_id, seq)",
            [],
        )?;

        Ok(SqliteMessageStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }
}

impl MessageStore for SqliteMessageStore {
    fn persist(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let stored = message.into_stored();
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO messages (id, sender_id, receiver_id, text, image, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stored.id,
                stored.sender_id.as_str(),
                stored.receiver_id.as_str(),
                stored.text,
                stored.image,
                stored.created_at.timestamp_millis()
            ],
        )?;
        Ok(stored)
    }

    fn conversation(
        &self,
        a: &Identity,
        b: &Identity,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, receiver_id, text, image, created_at_ms FROM (
                SELECT * FROM messages
                WHERE (sender_id = ?1 AND receiver_id = ?2)
                   OR (sender_id = ?2 AND receiver_id = ?1)
                ORDER BY seq DESC
                LIMIT ?3
             ) ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(
            params![a.as_str(), b.as_str(), limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, sender, receiver, text, image, created_at_ms) = row?;
            let sender_id = Identity::new(sender)
                .ok_or_else(|| StoreError::Corrupt(format!("bad sender in {}", id)))?;
            let receiver_id = Identity::new(receiver)
                .ok_or_else(|| StoreError::Corrupt(format!("bad receiver in {}", id)))?;
            let created_at = Utc
                .timestamp_millis_opt(created_at_ms)
                .single()
                .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp in {}", id)))?;
            messages.push(ChatMessage {
                id,
                sender_id,
                receiver_id,
                text,
                image,
                created_at,
            });
        }
        Ok(messages)
    }

    fn message_count(&self) -> usize {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Creates a message store based on the backend type.
pub fn create_message_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Result<Box<dyn MessageStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryMessageStore::new())),
        StorageBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join("messages.db"))
                .unwrap_or_else(|| std::path::PathBuf::from("messages.db"));

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            Ok(Box::new(SqliteMessageStore::open(&path)?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
