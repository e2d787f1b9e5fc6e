use chrono::NaiveDateTime;
use sqlx::{Executor, Sqlite};

use super::models::{Message, NewMessage, SessionStatus, StreamingSession};
use crate::{RagError, Result};

fn db_err(e: sqlx::Error) -> RagError {
    RagError::Database(e.to_string())
}

pub struct MessageQueries;

impl MessageQueries {
    pub async fn create<'e, E>(executor: E, message: &NewMessage) -> Result<Message>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Message>(
            "INSERT INTO messages (chat_id, role, content, streaming_session_id, created_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             RETURNING id, chat_id, role, content, streaming_session_id, created_at",
        )
        .bind(message.chat_id)
        .bind(message.role)
        .bind(&message.content)
        .bind(&message.streaming_session_id)
        .fetch_one(executor)
        .await
        .map_err(db_err)
    }

    /// Returns up to `limit` messages for a chat in chronological order.
    pub async fn recent<'e, E>(executor: E, chat_id: i64, limit: u32) -> Result<Vec<Message>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let mut messages = sqlx::query_as::<_, Message>(
            "SELECT id, chat_id, role, content, streaming_session_id, created_at
             FROM messages
             WHERE chat_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(chat_id)
        .bind(limit)
        .fetch_all(executor)
        .await
        .map_err(db_err)?;

        messages.reverse();
        Ok(messages)
    }
}

pub struct SessionQueries;

impl SessionQueries {
    pub async fn create<'e, E>(executor: E, id: &str, chat_id: i64, user_id: i64) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO streaming_sessions (id, chat_id, user_id, status, content_buffer, started_at)
             VALUES (?, ?, ?, 'active', '', CURRENT_TIMESTAMP)",
        )
        .bind(id)
        .bind(chat_id)
        .bind(user_id)
        .execute(executor)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get<'e, E>(executor: E, id: &str) -> Result<Option<StreamingSession>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, StreamingSession>(
            "SELECT id, chat_id, user_id, status, content_buffer, started_at, completed_at
             FROM streaming_sessions
             WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)
    }

    /// Appends a chunk only while the session is still active. Returns false
    /// when the session has already reached a terminal status (or does not
    /// exist), which tells the caller to stop forwarding output.
    pub async fn append_chunk<'e, E>(executor: E, id: &str, chunk: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE streaming_sessions
             SET content_buffer = content_buffer || ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(chunk)
        .bind(id)
        .execute(executor)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Transitions an active session to a terminal status. Returns false when
    /// the session was not active, so concurrent finalizers cannot race.
    pub async fn transition<'e, E>(executor: E, id: &str, status: SessionStatus) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE streaming_sessions
             SET status = ?, completed_at = CURRENT_TIMESTAMP
             WHERE id = ? AND status = 'active'",
        )
        .bind(status)
        .bind(id)
        .execute(executor)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn active_started_before<'e, E>(
        executor: E,
        cutoff: NaiveDateTime,
    ) -> Result<Vec<StreamingSession>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, StreamingSession>(
            "SELECT id, chat_id, user_id, status, content_buffer, started_at, completed_at
             FROM streaming_sessions
             WHERE status = 'active' AND started_at < ?",
        )
        .bind(cutoff)
        .fetch_all(executor)
        .await
        .map_err(db_err)
    }
}
