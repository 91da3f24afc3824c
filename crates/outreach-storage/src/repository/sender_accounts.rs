//! Sender account repository

use crate::db::DatabasePool;
use crate::models::SenderAccount;
use async_trait::async_trait;
use outreach_common::types::AccountId;
use outreach_common::{Error, Result};
use uuid::Uuid;

/// Sender account repository trait
#[async_trait]
pub trait SenderAccountRepository: Send + Sync {
    async fn create(
        &self,
        owner_id: AccountId,
        display_name: &str,
        external_account_id: &str,
        route_id: &str,
    ) -> Result<SenderAccount>;

    /// All sender accounts of an owner, oldest first
    async fn list_by_owner(&self, owner_id: AccountId) -> Result<Vec<SenderAccount>>;
}

/// Database sender account repository
pub struct DbSenderAccountRepository {
    pool: DatabasePool,
}

impl DbSenderAccountRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SenderAccountRepository for DbSenderAccountRepository {
    async fn create(
        &self,
        owner_id: AccountId,
        display_name: &str,
        external_account_id: &str,
        route_id: &str,
    ) -> Result<SenderAccount> {
        sqlx::query_as::<_, SenderAccount>(
            r#"
            INSERT INTO sender_accounts (id, owner_id, display_name, external_account_id, route_id, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(owner_id)
        .bind(display_name)
        .bind(external_account_id)
        .bind(route_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_owner(&self, owner_id: AccountId) -> Result<Vec<SenderAccount>> {
        sqlx::query_as::<_, SenderAccount>(
            "SELECT * FROM sender_accounts WHERE owner_id = $1 ORDER BY created_at ASC",
        )
        .bind(owner_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
