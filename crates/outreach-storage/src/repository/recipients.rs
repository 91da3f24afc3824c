//! Recipient repository

use crate::db::DatabasePool;
use crate::filter::RecipientFilter;
use crate::models::{CreateRecipient, Recipient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_common::types::{AccountId, RecipientId};
use outreach_common::{Error, Result};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

/// Recipient repository trait
///
/// Listing methods return recipients ordered by creation time, then id,
/// so audience positions stay stable between dispatcher runs.
#[async_trait]
pub trait RecipientRepository: Send + Sync {
    async fn create(&self, input: CreateRecipient) -> Result<Recipient>;
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>>;

    /// Opted-in recipients of `owner_id` among `ids`
    async fn list_opted_in_by_ids(&self, owner_id: AccountId, ids: &[RecipientId]) -> Result<Vec<Recipient>>;

    /// Recipients matching a compiled filter
    async fn list_matching(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>>;

    async fn touch_last_contacted(&self, id: RecipientId, at: DateTime<Utc>) -> Result<()>;
}

/// Database recipient repository
pub struct DbRecipientRepository {
    pool: DatabasePool,
}

impl DbRecipientRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientRepository for DbRecipientRepository {
    async fn create(&self, input: CreateRecipient) -> Result<Recipient> {
        sqlx::query_as::<_, Recipient>(
            r#"
            INSERT INTO recipients (
                id, owner_id, phone, name, email, opted_in, tags, custom_fields,
                sender_account_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.owner_id)
        .bind(&input.phone)
        .bind(&input.name)
        .bind(&input.email)
        .bind(input.opted_in)
        .bind(&input.tags)
        .bind(serde_json::Value::Object(input.custom_fields))
        .bind(input.sender_account_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_opted_in_by_ids(&self, owner_id: AccountId, ids: &[RecipientId]) -> Result<Vec<Recipient>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, Recipient>(
            r#"
            SELECT * FROM recipients
            WHERE owner_id = $1 AND opted_in = TRUE AND id = ANY($2)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(owner_id)
        .bind(ids)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_matching(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM recipients");
        filter.push_where(&mut qb);
        qb.push(" ORDER BY created_at ASC, id ASC");

        qb.build_query_as::<Recipient>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn touch_last_contacted(&self, id: RecipientId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE recipients SET last_contacted_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
