//! Campaign repository
//!
//! Besides plain lookups this owns the two conditional updates the
//! dispatcher relies on: taking the processing guard and moving a
//! scheduled campaign to active. Both are single `UPDATE ... WHERE`
//! statements so concurrent dispatcher runs cannot both win.
//!
//! The guard stamp (`processing_started_at`) doubles as the holder token:
//! progress writes and release only apply while the stamp is unchanged.
//! Stamps are compared for equality, so callers pass microsecond-aligned
//! values (the column precision).

use crate::db::DatabasePool;
use crate::models::{Campaign, CampaignProgress, CreateCampaign};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use outreach_common::types::CampaignId;
use outreach_common::{Error, Result};
use sqlx::types::Json;
use uuid::Uuid;

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Scheduled campaigns plus active ones whose guard is free or older than `lease`
    async fn list_dispatchable(&self, now: DateTime<Utc>, lease: Duration) -> Result<Vec<Campaign>>;

    /// Take the processing guard, stamping it with `now`. Returns false if
    /// another run holds a live lease.
    async fn try_acquire_guard(&self, id: CampaignId, now: DateTime<Utc>, lease: Duration) -> Result<bool>;

    /// Drop the guard stamped `holder`; false if it has been taken over
    async fn release_guard(&self, id: CampaignId, holder: DateTime<Utc>) -> Result<bool>;

    /// Persist progress and move the guard stamp from `holder` to `renewed`.
    /// Writes nothing and returns false if `holder` no longer owns the guard.
    async fn save_progress(
        &self,
        id: CampaignId,
        progress: &CampaignProgress,
        holder: DateTime<Utc>,
        renewed: DateTime<Utc>,
    ) -> Result<bool>;

    /// `scheduled -> active`; false if the campaign was no longer scheduled
    async fn activate(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool>;
    async fn mark_completed(&self, id: CampaignId, now: DateTime<Utc>) -> Result<()>;
    async fn mark_failed(&self, id: CampaignId, reason: &str, now: DateTime<Utc>) -> Result<()>;
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, owner_id, name, campaign_type, status, message, audience, schedule,
                retry, pricing, sender_account_id, progress, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, '{}', $12, $12)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.owner_id)
        .bind(&input.name)
        .bind(input.campaign_type.to_string())
        .bind(input.status.to_string())
        .bind(Json(&input.message))
        .bind(Json(&input.audience))
        .bind(input.schedule.as_ref().map(Json))
        .bind(Json(&input.retry))
        .bind(input.pricing.as_ref().map(Json))
        .bind(input.sender_account_id)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_dispatchable(&self, now: DateTime<Utc>, lease: Duration) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled'
               OR (status = 'active'
                   AND (processing = FALSE
                        OR processing_started_at IS NULL
                        OR processing_started_at < $1))
            ORDER BY created_at ASC
            "#,
        )
        .bind(now - lease)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn try_acquire_guard(&self, id: CampaignId, now: DateTime<Utc>, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET processing = TRUE, processing_started_at = $2, updated_at = $2
            WHERE id = $1
              AND status = 'active'
              AND (processing = FALSE
                   OR processing_started_at IS NULL
                   OR processing_started_at < $3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now - lease)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_guard(&self, id: CampaignId, holder: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET processing = FALSE, processing_started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND processing = TRUE AND processing_started_at = $2
            "#,
        )
        .bind(id)
        .bind(holder)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_progress(
        &self,
        id: CampaignId,
        progress: &CampaignProgress,
        holder: DateTime<Utc>,
        renewed: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET progress = $2, processing_started_at = $4, updated_at = $4
            WHERE id = $1 AND processing = TRUE AND processing_started_at = $3
            "#,
        )
        .bind(id)
        .bind(Json(progress))
        .bind(holder)
        .bind(renewed)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn activate(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'active', activated_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, id: CampaignId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'completed', completed_at = $2, updated_at = $2,
                processing = FALSE, processing_started_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn mark_failed(&self, id: CampaignId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'failed', failure_reason = $2, failed_at = $3, updated_at = $3,
                processing = FALSE, processing_started_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
