//! Persistent SQLite store: the chat allow-list and the message archive.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::chatbot::message::{ChatIdentity, ChatMessage, MessageKind, Participant};
use crate::chatbot::pool::AllowList;
use crate::chatbot::session::MessageArchive;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("Failed to open database {path:?}: {e}"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;

        let (chats, messages) = db.counts();
        info!("Loaded database from {:?} ({} allowed chats, {} messages)", path, chats, messages);
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("Failed to create in-memory database: {e}"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), String> {
        self.conn()
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS allowed_chats (
                chat_id TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS messages (
                chat TEXT NOT NULL,
                id TEXT NOT NULL,
                kind TEXT NOT NULL,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                reply_to_id TEXT,
                PRIMARY KEY (chat, id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat_timestamp ON messages(chat, timestamp);
        "#,
            )
            .map_err(|e| format!("Failed to initialize database schema: {e}"))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn counts(&self) -> (usize, usize) {
        let conn = self.conn();
        let chats: i64 = conn
            .query_row("SELECT COUNT(*) FROM allowed_chats", [], |row| row.get(0))
            .unwrap_or(0);
        let messages: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap_or(0);
        (chats as usize, messages as usize)
    }

    // ==================== ALLOW-LIST ====================

    pub fn allow_chat(&self, chat_id: &str) -> Result<(), String> {
        self.conn()
            .execute("INSERT OR IGNORE INTO allowed_chats (chat_id) VALUES (?1)", params![chat_id])
            .map(|_| ())
            .map_err(|e| format!("Failed to allow chat {chat_id}: {e}"))
    }

    pub fn disallow_chat(&self, chat_id: &str) -> Result<(), String> {
        self.conn()
            .execute("DELETE FROM allowed_chats WHERE chat_id = ?1", params![chat_id])
            .map(|_| ())
            .map_err(|e| format!("Failed to disallow chat {chat_id}: {e}"))
    }

    // ==================== MESSAGES ====================

    /// The newest `limit` archived messages of `chat`, oldest first.
    pub fn recent_messages(&self, chat: &ChatIdentity, limit: usize) -> Result<Vec<ChatMessage>, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, sender, text, timestamp, reply_to_id
                 FROM messages WHERE chat = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(|e| format!("Failed to prepare history query: {e}"))?;

        let rows = stmt
            .query_map(params![chat.to_string(), limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|e| format!("Failed to query history: {e}"))?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, kind, sender, text, timestamp, reply_to_id) =
                row.map_err(|e| format!("Failed to read history row: {e}"))?;
            let timestamp = match DateTime::parse_from_rfc3339(&timestamp) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    warn!("Skipping message {id} with bad timestamp {timestamp:?}: {e}");
                    continue;
                }
            };
            messages.push(ChatMessage {
                id,
                kind: MessageKind::parse(&kind),
                sender: Participant::new(sender),
                text,
                timestamp,
                reply_to_id,
            });
        }

        messages.reverse();
        Ok(messages)
    }

    #[cfg(test)]
    fn message_count(&self) -> usize {
        self.conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }
}

impl AllowList for Database {
    fn is_allowed_chat(&self, chat_id: &str) -> bool {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM allowed_chats WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get::<_, i64>(0),
            )
            .optional();
        match found {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!("Allow-list lookup failed for {chat_id}: {e}");
                false
            }
        }
    }
}

impl MessageArchive for Database {
    fn archive(&self, chat: &ChatIdentity, message: &ChatMessage) -> Result<(), String> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO messages (chat, id, kind, sender, text, timestamp, reply_to_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chat.to_string(),
                    message.id,
                    message.kind.as_str(),
                    message.sender.name,
                    message.text,
                    message.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                    message.reply_to_id,
                ],
            )
            .map(|_| ())
            .map_err(|e| format!("Failed to archive message {}: {e}", message.id))
    }
}
