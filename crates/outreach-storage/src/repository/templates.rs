//! Message template repository

use crate::db::DatabasePool;
use crate::models::{MessageTemplate, TemplateComponent};
use async_trait::async_trait;
use outreach_common::types::{AccountId, TemplateId};
use outreach_common::{Error, Result};
use sqlx::types::Json;
use uuid::Uuid;

/// Template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn create(
        &self,
        owner_id: AccountId,
        name: &str,
        language: &str,
        components: Vec<TemplateComponent>,
    ) -> Result<MessageTemplate>;

    /// Template by id, only if it belongs to `owner_id`
    async fn get(&self, owner_id: AccountId, id: TemplateId) -> Result<Option<MessageTemplate>>;
}

/// Database template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn create(
        &self,
        owner_id: AccountId,
        name: &str,
        language: &str,
        components: Vec<TemplateComponent>,
    ) -> Result<MessageTemplate> {
        sqlx::query_as::<_, MessageTemplate>(
            r#"
            INSERT INTO message_templates (id, owner_id, name, language, components, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(owner_id)
        .bind(name)
        .bind(language)
        .bind(Json(components))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, owner_id: AccountId, id: TemplateId) -> Result<Option<MessageTemplate>> {
        sqlx::query_as::<_, MessageTemplate>(
            "SELECT * FROM message_templates WHERE id = $1 AND owner_id = $2",
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
