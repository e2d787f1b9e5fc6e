pub mod models;
pub mod queries;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::str::FromStr;

use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{RagError, Result};
use models::{Message, MessageRole, NewMessage, SessionStatus, StreamingSession};
use queries::{MessageQueries, SessionQueries};

const SCHEMA: &str = include_str!("migrations/001_initial_schema.sql");
const INTERRUPTED_MARKER: &str = "\n\n[Error: Streaming was interrupted]";

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Opens (creating if necessary) the chat database at the given path and
    /// applies the schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| RagError::Database(format!("Failed to open {}: {e}", path.display())))?;

        let db = Self { pool };
        db.apply_schema().await?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RagError::Database(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        let db = Self { pool };
        db.apply_schema().await?;
        Ok(db)
    }

    async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| RagError::Database(format!("Failed to apply schema: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn create_message(&self, message: &NewMessage) -> Result<Message> {
        MessageQueries::create(&self.pool, message).await
    }

    pub async fn recent_messages(&self, chat_id: i64, limit: u32) -> Result<Vec<Message>> {
        MessageQueries::recent(&self.pool, chat_id, limit).await
    }
}

/// Lifecycle manager for durable streaming sessions.
///
/// A session starts `active`, accumulates chunks in its content buffer, and
/// ends in exactly one terminal status: `completed`, `stopped`, or `error`.
/// The assistant message is only written once the terminal transition lands,
/// so a crash mid-stream never leaves a half-written message behind.
#[derive(Clone)]
pub struct SessionService {
    db: Database,
}

impl SessionService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Persists the user's message and opens a streaming session for the
    /// assistant reply, atomically.
    pub async fn start_session(
        &self,
        chat_id: i64,
        user_id: i64,
        user_message: &str,
    ) -> Result<String> {
        if user_message.trim().is_empty() {
            return Err(RagError::Validation("Message must not be empty".into()));
        }

        let session_id = Uuid::new_v4().to_string();
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        MessageQueries::create(
            &mut *tx,
            &NewMessage {
                chat_id,
                role: MessageRole::User,
                content: user_message.to_string(),
                streaming_session_id: None,
            },
        )
        .await?;
        SessionQueries::create(&mut *tx, &session_id, chat_id, user_id).await?;

        tx.commit()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        info!("Started streaming session {session_id} for chat {chat_id}");
        Ok(session_id)
    }

    /// Appends a chunk to an active session's buffer. Returns false when the
    /// session is no longer active, signalling the producer to stop.
    pub async fn append_chunk(&self, session_id: &str, chunk: &str) -> Result<bool> {
        SessionQueries::append_chunk(&self.db.pool, session_id, chunk).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<StreamingSession>> {
        SessionQueries::get(&self.db.pool, session_id).await
    }

    /// Completes an active session: marks it `completed` and writes the
    /// buffered content as the assistant message.
    pub async fn finalize(&self, session_id: &str) -> Result<Message> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        let session = SessionQueries::get(&mut *tx, session_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("Streaming session {session_id}")))?;
        if !SessionQueries::transition(&mut *tx, session_id, SessionStatus::Completed).await? {
            return Err(RagError::NotFound(format!(
                "Streaming session {session_id} is not active"
            )));
        }

        let message = MessageQueries::create(
            &mut *tx,
            &NewMessage {
                chat_id: session.chat_id,
                role: MessageRole::Assistant,
                content: session.content_buffer,
                streaming_session_id: Some(session_id.to_string()),
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        info!("Finalized streaming session {session_id}");
        Ok(message)
    }

    /// Stops an active session on the owner's request, persisting whatever
    /// partial content has been buffered so far.
    pub async fn stop(&self, session_id: &str, user_id: i64) -> Result<Message> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        let session = SessionQueries::get(&mut *tx, session_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("Streaming session {session_id}")))?;
        if session.user_id != user_id {
            return Err(RagError::Unauthorized(format!(
                "Session {session_id} belongs to another user"
            )));
        }
        if !SessionQueries::transition(&mut *tx, session_id, SessionStatus::Stopped).await? {
            return Err(RagError::NotFound(format!(
                "Streaming session {session_id} is not active"
            )));
        }

        let message = MessageQueries::create(
            &mut *tx,
            &NewMessage {
                chat_id: session.chat_id,
                role: MessageRole::Assistant,
                content: session.content_buffer,
                streaming_session_id: Some(session_id.to_string()),
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        info!("Stopped streaming session {session_id}");
        Ok(message)
    }

    /// Marks an active session as failed. Buffered content, if any, is
    /// persisted with an error marker so the partial reply survives.
    pub async fn fail(&self, session_id: &str, error: &str) -> Result<()> {
        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        let Some(session) = SessionQueries::get(&mut *tx, session_id).await? else {
            warn!("Cannot fail unknown streaming session {session_id}");
            return Ok(());
        };
        if !SessionQueries::transition(&mut *tx, session_id, SessionStatus::Error).await? {
            return Ok(());
        }

        if !session.content_buffer.is_empty() {
            MessageQueries::create(
                &mut *tx,
                &NewMessage {
                    chat_id: session.chat_id,
                    role: MessageRole::Assistant,
                    content: format!("{}\n\n[Error: {error}]", session.content_buffer),
                    streaming_session_id: Some(session_id.to_string()),
                },
            )
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        warn!("Streaming session {session_id} failed: {error}");
        Ok(())
    }

    /// Sweeps sessions that have been active for longer than the timeout,
    /// marking them as errored and salvaging any buffered content. Returns
    /// how many sessions were reaped.
    pub async fn reap_abandoned(&self, timeout_minutes: i64) -> Result<usize> {
        let cutoff = Utc::now().naive_utc() - Duration::minutes(timeout_minutes);
        let abandoned = SessionQueries::active_started_before(&self.db.pool, cutoff).await?;

        let mut reaped = 0;
        for session in abandoned {
            let mut tx = self
                .db
                .pool
                .begin()
                .await
                .map_err(|e| RagError::Database(e.to_string()))?;

            if !SessionQueries::transition(&mut *tx, &session.id, SessionStatus::Error).await? {
                continue;
            }
            if !session.content_buffer.is_empty() {
                MessageQueries::create(
                    &mut *tx,
                    &NewMessage {
                        chat_id: session.chat_id,
                        role: MessageRole::Assistant,
                        content: format!("{}{INTERRUPTED_MARKER}", session.content_buffer),
                        streaming_session_id: Some(session.id.clone()),
                    },
                )
                .await?;
            }

            tx.commit()
                .await
                .map_err(|e| RagError::Database(e.to_string()))?;

            warn!("Reaped abandoned streaming session {}", session.id);
            reaped += 1;
        }

        Ok(reaped)
    }
}
