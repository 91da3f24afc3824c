//! Wallet repository
//!
//! Prepaid balances and their ledger. A debit is a single transaction:
//! conditional balance decrement, then the ledger row. The ledger has a
//! unique index on (account, kind, reference), which makes a debit for
//! the same reference idempotent even when two runs race.

use crate::db::DatabasePool;
use crate::models::{DebitOutcome, DebitRequest, Wallet, WalletTransaction};
use async_trait::async_trait;
use outreach_common::types::{AccountId, Credits};
use outreach_common::{Error, Result};
use tracing::{debug, warn};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

/// Wallet repository trait
#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn get(&self, account_id: AccountId) -> Result<Option<Wallet>>;

    /// Add funds, creating the wallet if needed. Returns the new balance.
    async fn credit(&self, account_id: AccountId, amount: Credits, reason: &str) -> Result<Credits>;

    /// Atomically check and debit. Never leaves a partial charge.
    async fn debit(&self, request: DebitRequest) -> Result<DebitOutcome>;

    async fn transactions(&self, account_id: AccountId) -> Result<Vec<WalletTransaction>>;
}

/// Database wallet repository
pub struct DbWalletRepository {
    pool: DatabasePool,
}

impl DbWalletRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn current_balance(&self, account_id: AccountId) -> Result<Credits> {
        let balance: Option<(Credits,)> =
            sqlx::query_as("SELECT balance FROM wallets WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(balance.map(|(b,)| b).unwrap_or(0))
    }
}

#[async_trait]
impl WalletRepository for DbWalletRepository {
    async fn get(&self, account_id: AccountId) -> Result<Option<Wallet>> {
        sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn credit(&self, account_id: AccountId, amount: Credits, reason: &str) -> Result<Credits> {
        if amount <= 0 {
            return Err(Error::Validation("Credit amount must be positive".to_string()));
        }

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let (balance,): (Credits,) = sqlx::query_as(
            r#"
            INSERT INTO wallets (account_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (account_id) DO UPDATE
            SET balance = wallets.balance + EXCLUDED.balance, updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO wallet_transactions (id, account_id, kind, amount, balance_after, reason, created_at)
            VALUES ($1, $2, 'credit', $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(account_id)
        .bind(amount)
        .bind(balance)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(balance)
    }

    async fn debit(&self, request: DebitRequest) -> Result<DebitOutcome> {
        if request.amount <= 0 {
            return Err(Error::Validation("Debit amount must be positive".to_string()));
        }

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM wallet_transactions
            WHERE account_id = $1 AND kind = 'debit' AND reference_id = $2
            "#,
        )
        .bind(request.account_id)
        .bind(request.reference_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if existing.is_some() {
            tx.rollback()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            debug!("Debit for reference {} already recorded", request.reference_id);
            return Ok(DebitOutcome::AlreadyRecorded {
                balance: self.current_balance(request.account_id).await?,
            });
        }

        let updated: Option<(Credits,)> = sqlx::query_as(
            r#"
            UPDATE wallets
            SET balance = balance - $2, updated_at = NOW()
            WHERE account_id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(request.account_id)
        .bind(request.amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let Some((balance,)) = updated else {
            tx.rollback()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            return Ok(DebitOutcome::InsufficientFunds {
                balance: self.current_balance(request.account_id).await?,
            });
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO wallet_transactions (
                id, account_id, kind, amount, balance_after, reason, reference_id, created_at
            )
            VALUES ($1, $2, 'debit', $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(request.account_id)
        .bind(request.amount)
        .bind(balance)
        .bind(&request.reason)
        .bind(request.reference_id)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                // A concurrent run recorded the same reference first; dropping
                // the transaction rolls back our decrement.
                warn!("Concurrent debit for reference {}", request.reference_id);
                drop(tx);
                return Ok(DebitOutcome::AlreadyRecorded {
                    balance: self.current_balance(request.account_id).await?,
                });
            }
            Err(e) => return Err(Error::Database(e.to_string())),
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(DebitOutcome::Debited { balance })
    }

    async fn transactions(&self, account_id: AccountId) -> Result<Vec<WalletTransaction>> {
        sqlx::query_as::<_, WalletTransaction>(
            "SELECT * FROM wallet_transactions WHERE account_id = $1 ORDER BY created_at ASC",
        )
        .bind(account_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
