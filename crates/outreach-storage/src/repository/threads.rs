//! Thread repository
//!
//! Conversation threads are append-only logs per (owner, recipient).

use crate::db::DatabasePool;
use crate::models::{NewThreadMessage, ThreadMessage};
use async_trait::async_trait;
use outreach_common::types::{AccountId, RecipientId, ThreadId};
use outreach_common::{Error, Result};
use uuid::Uuid;

/// Thread repository trait
#[async_trait]
pub trait ThreadRepository: Send + Sync {
    /// Append an outbound message, creating the thread on first use
    async fn append_message(
        &self,
        owner_id: AccountId,
        recipient_id: RecipientId,
        message: NewThreadMessage,
    ) -> Result<ThreadMessage>;

    async fn list_messages(&self, owner_id: AccountId, recipient_id: RecipientId) -> Result<Vec<ThreadMessage>>;
}

/// Database thread repository
pub struct DbThreadRepository {
    pool: DatabasePool,
}

impl DbThreadRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ThreadRepository for DbThreadRepository {
    async fn append_message(
        &self,
        owner_id: AccountId,
        recipient_id: RecipientId,
        message: NewThreadMessage,
    ) -> Result<ThreadMessage> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // Find-or-create in one statement; the unique (owner_id, recipient_id)
        // constraint decides which concurrent insert wins.
        let (thread_id,): (ThreadId,) = sqlx::query_as(
            r#"
            INSERT INTO threads (id, owner_id, recipient_id, message_count, created_at, last_message_at)
            VALUES ($1, $2, $3, 1, $4, $4)
            ON CONFLICT (owner_id, recipient_id) DO UPDATE
            SET message_count = threads.message_count + 1,
                last_message_at = EXCLUDED.last_message_at
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(owner_id)
        .bind(recipient_id)
        .bind(message.sent_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let entry = sqlx::query_as::<_, ThreadMessage>(
            r#"
            INSERT INTO thread_messages (
                id, thread_id, direction, campaign_id, sender_account_id,
                gateway_message_id, body, created_at
            )
            VALUES ($1, $2, 'outbound', $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(thread_id)
        .bind(message.campaign_id)
        .bind(message.sender_account_id)
        .bind(&message.gateway_message_id)
        .bind(&message.body)
        .bind(message.sent_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(entry)
    }

    async fn list_messages(&self, owner_id: AccountId, recipient_id: RecipientId) -> Result<Vec<ThreadMessage>> {
        sqlx::query_as::<_, ThreadMessage>(
            r#"
            SELECT m.* FROM thread_messages m
            JOIN threads t ON t.id = m.thread_id
            WHERE t.owner_id = $1 AND t.recipient_id = $2
            ORDER BY m.created_at ASC
            "#,
        )
        .bind(owner_id)
        .bind(recipient_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
