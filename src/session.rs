//! Conversation sessions and message history.
//!
//! Messages are append-only and carry a per-session `sequence` that is
//! strictly increasing and never reused, so history replays in insertion
//! order regardless of wall-clock skew. Appends to the same session are
//! serialized through a per-session async lock; the sequence number is
//! computed and written inside one transaction under that lock. Deleting
//! a session removes its messages in the same operation via the schema's
//! cascade rule.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Message, Role, Session};

pub struct SessionStore {
    pool: SqlitePool,
    /// One lock per session id, created on first use. Serializes appends
    /// so concurrent turns interleave whole, never splice.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The append lock for a session. The pipeline holds this across a
    /// whole turn (user message, generation, assistant message) so two
    /// turns on one session cannot interleave their writes.
    pub async fn turn_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    pub async fn create_session(&self, title: &str) -> Result<Session> {
        let now = chrono::Utc::now().timestamp();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Session {
            id: r.get("id"),
            title: r.get("title"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// All sessions, most recently touched first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM sessions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Session {
                id: r.get("id"),
                title: r.get("title"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    /// Delete a session and, through the cascade, all of its messages.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        self.locks.lock().await.remove(session_id);
        Ok(())
    }

    /// Append a message, assigning the next sequence number.
    ///
    /// Takes the session's append lock for the duration of the write; the
    /// pipeline may instead hold [`turn_lock`](Self::turn_lock) itself and
    /// call [`append_message_locked`](Self::append_message_locked).
    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        let lock = self.turn_lock(session_id).await;
        let _guard = lock.lock().await;
        self.append_message_locked(session_id, role, content).await
    }

    /// Append without taking the session lock. The caller must hold the
    /// session's [`turn_lock`](Self::turn_lock).
    pub async fn append_message_locked(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            bail!("No such session: {}", session_id);
        }

        let sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            sequence,
            created_at: chrono::Utc::now().timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, content, sequence, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.sequence)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(message.created_at)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    /// Full history in sequence order. A deleted or unknown session reads
    /// as empty history, not an error.
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, role, content, sequence, created_at
            FROM messages
            WHERE session_id = ?
            ORDER BY sequence
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let role_str: String = r.get("role");
                let role = Role::parse(&role_str)
                    .ok_or_else(|| anyhow::anyhow!("Unknown role in store: {}", role_str))?;
                Ok(Message {
                    id: r.get("id"),
                    session_id: r.get("session_id"),
                    role,
                    content: r.get("content"),
                    sequence: r.get("sequence"),
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }
}
