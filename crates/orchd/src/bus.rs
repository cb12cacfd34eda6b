//! In-process messaging fabric: a durable, SQLite-backed outbox implementing
//! the subject-chain pub/sub contract step workers are driven by (Section 4.3).
//!
//! This is the "external" messaging fabric collaborator, implemented locally
//! rather than delegated to a real broker: durable append-only stream,
//! explicit ack/nak/term, redelivery backoff, max-deliver ceiling, and
//! publish-time dedup by message-id.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Per-attempt redelivery backoff (Section 4.4 "nak with the backoff delay for
/// this attempt"). Indexed by `delivery_count` after the failed attempt.
const BACKOFF_SCHEDULE_SEC: [i64; 5] = [1, 5, 15, 60, 300];

fn backoff_delay_sec(attempt: u32) -> i64 {
    let idx = (attempt.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE_SEC.len() - 1);
    BACKOFF_SCHEDULE_SEC[idx]
}

/// A claimed message, ready for decode.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub subject: String,
    pub message_id: String,
    pub payload: serde_json::Value,
    pub delivery_count: u32,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Poison record persisted after retries are exhausted or decode fails.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoisonRecord {
    pub subject: String,
    pub op_id: Option<String>,
    pub reason: String,
    pub payload: String,
    pub delivery_count: u32,
}

/// Durable outbox/queue over `bus_messages`.
pub struct MessageBus {
    pool: Pool<Sqlite>,
}

/// Truncate a payload for poison storage so a single bad message can't bloat
/// the poison table.
const MAX_POISON_PAYLOAD_BYTES: usize = 4096;

impl MessageBus {
    pub fn new(pool: Pool<Sqlite>) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Publish a message, deduped by `message_id`. A duplicate publish is a
    /// silent no-op (Section 4.4 "message-id ... to dedup identical republishes").
    pub async fn publish<T: Serialize>(
        &self,
        subject: &str,
        message_id: &str,
        payload: &T,
    ) -> Result<()> {
        let payload_json = serde_json::to_string(payload)?;
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO bus_messages (id, subject, message_id, payload_json, delivery_count,
                                      visible_at, created_at, terminal)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, 0)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(orch_core::Id::new().to_string())
        .bind(subject)
        .bind(message_id)
        .bind(&payload_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch one visible, non-terminal message on `subject` with a bounded wait,
    /// polling at a short interval. Returns `None` on timeout (Section 4.4 step 1).
    pub async fn fetch(&self, subject: &str, wait: Duration) -> Result<Option<Message>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(message) = self.try_fetch_once(subject).await? {
                return Ok(Some(message));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn try_fetch_once(&self, subject: &str) -> Result<Option<Message>> {
        let now = Utc::now().timestamp_millis();
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, message_id, payload_json, delivery_count FROM bus_messages
            WHERE subject = ?1 AND terminal = 0 AND visible_at <= ?2
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(subject)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, message_id, payload_json, delivery_count)) = row else {
            return Ok(None);
        };

        let delivery_count = delivery_count as u32 + 1;
        // Make the message invisible while in flight; ack/nak/term settle it.
        sqlx::query("UPDATE bus_messages SET delivery_count = ?1, visible_at = ?2 WHERE id = ?3")
            .bind(delivery_count as i64)
            .bind(now + 30_000)
            .bind(&id)
            .execute(&self.pool)
            .await?;

        let payload: serde_json::Value = serde_json::from_str(&payload_json)?;
        Ok(Some(Message {
            id,
            subject: subject.to_string(),
            message_id,
            payload,
            delivery_count,
        }))
    }

    /// Acknowledge successful (or skip) processing: remove the message.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        sqlx::query("DELETE FROM bus_messages WHERE id = ?1")
            .bind(&message.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Negative-acknowledge: make the message visible again after a backoff delay.
    pub async fn nak(&self, message: &Message) -> Result<()> {
        let delay = backoff_delay_sec(message.delivery_count);
        let visible_at = Utc::now().timestamp_millis() + delay * 1000;
        sqlx::query("UPDATE bus_messages SET visible_at = ?1 WHERE id = ?2")
            .bind(visible_at)
            .bind(&message.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminate a message: non-retryable, removed without further redelivery.
    pub async fn term(&self, message: &Message) -> Result<()> {
        sqlx::query("DELETE FROM bus_messages WHERE id = ?1")
            .bind(&message.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store a poison record on `worker.poison` (Section 4.4, Section 7).
    pub async fn poison(&self, record: PoisonRecord) -> Result<()> {
        let mut payload = record.payload;
        if payload.len() > MAX_POISON_PAYLOAD_BYTES {
            payload.truncate(MAX_POISON_PAYLOAD_BYTES);
            payload.push_str("...(truncated)");
        }
        sqlx::query(
            r#"
            INSERT INTO poison_messages (id, subject, op_id, reason, payload_json,
                                         delivery_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(orch_core::Id::new().to_string())
        .bind(&record.subject)
        .bind(&record.op_id)
        .bind(&record.reason)
        .bind(&payload)
        .bind(record.delivery_count as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List poison records, most recent first (used by tests and admin tooling).
    pub async fn list_poison(&self) -> Result<Vec<PoisonRow>> {
        let rows = sqlx::query_as::<_, PoisonRow>(
            "SELECT id, subject, op_id, reason, payload_json, delivery_count, created_at \
             FROM poison_messages ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct PoisonRow {
    pub id: String,
    pub subject: String,
    pub op_id: Option<String>,
    pub reason: String,
    pub payload_json: String,
    pub delivery_count: i64,
    pub created_at: i64,
}
