//! Message queue backed by PostgreSQL.
//!
//! Topics share the `deckhand_messages` table. Consumers claim with
//! `SKIP LOCKED` so several processes can drain the same topic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_core::events::{EventBus, Message, MessageSource};
use deckhand_core::{Error, Result};
use deckhand_db::DbError;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts after which a failing message stops being redelivered.
pub const MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedMessage {
    pub id: uuid::Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<QueuedMessage> for Message {
    fn from(row: QueuedMessage) -> Self {
        Message {
            id: row.id.to_string(),
            topic: row.topic,
            payload: row.payload,
            attempts: row.attempts,
        }
    }
}

fn db_error(err: sqlx::Error) -> Error {
    DbError::from(err).into()
}

fn message_id(raw: &str) -> Result<uuid::Uuid> {
    raw.parse()
        .map_err(|e| Error::InvalidInput(format!("invalid message id {raw}: {e}")))
}

pub struct PgMessageQueue {
    pool: PgPool,
}

impl PgMessageQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return messages claimed longer than `older_than` ago to pending, for
    /// consumers that died mid-message.
    pub async fn release_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::InvalidInput(format!("claim timeout out of range: {e}")))?;
        let released = sqlx::query(
            "UPDATE deckhand_messages SET status = 'pending', claimed_by = NULL, claimed_at = NULL \
             WHERE status = 'claimed' AND claimed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();
        if released > 0 {
            warn!(released, "Released stale message claims");
        }
        Ok(released)
    }
}

#[async_trait]
impl EventBus for PgMessageQueue {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<String> {
        let id = uuid::Uuid::now_v7();
        sqlx::query(
            "INSERT INTO deckhand_messages (id, topic, payload, status, created_at) \
             VALUES ($1, $2, $3, 'pending', NOW())",
        )
        .bind(id)
        .bind(topic)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        debug!(message_id = %id, topic, "Published message");
        Ok(id.to_string())
    }
}

#[async_trait]
impl MessageSource for PgMessageQueue {
    async fn claim(&self, consumer: &str, topic: &str) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, QueuedMessage>(
            r#"
            UPDATE deckhand_messages
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM deckhand_messages
                WHERE status = 'pending' AND topic = $2
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(consumer)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.map(Message::from))
    }

    async fn complete(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE deckhand_messages SET status = 'completed', error = NULL WHERE id = $1")
            .bind(message_id(id)?)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deckhand_messages
            SET status = CASE WHEN attempts >= $3 THEN 'failed' ELSE 'pending' END,
                claimed_by = NULL, claimed_at = NULL, error = $2
            WHERE id = $1
            "#,
        )
        .bind(message_id(id)?)
        .bind(error)
        .bind(MAX_ATTEMPTS)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}
