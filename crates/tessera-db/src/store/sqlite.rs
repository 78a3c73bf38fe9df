//! SQLite-backed entity store (`entities` table).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use tessera_core::RawEntity;

use super::EntityStore;
use crate::error::DbResult;

/// SQLite bound-parameter budget per statement.
const MAX_IN_PARAMS: usize = 500;

/// Entity store persisted in the node database.
#[derive(Debug, Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteEntityStore { pool }
    }

    fn decode(bodies: Vec<String>) -> DbResult<Vec<RawEntity>> {
        bodies
            .into_iter()
            .map(|body| -> DbResult<RawEntity> {
                let value: serde_json::Value = serde_json::from_str(&body)?;
                Ok(RawEntity::from_json(value)?)
            })
            .collect()
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn list_by_type(&self, entity_type: &str) -> DbResult<Vec<RawEntity>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM entities WHERE entity_type = ? ORDER BY id")
                .bind(entity_type)
                .fetch_all(&self.pool)
                .await?;

        Self::decode(bodies)
    }

    async fn get_by_ids(&self, ids: &[String]) -> DbResult<Vec<RawEntity>> {
        let mut found = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT body FROM entities WHERE id IN ({}) ORDER BY id",
                vec!["?"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            found.extend(Self::decode(query.fetch_all(&self.pool).await?)?);
        }

        Ok(found)
    }

    async fn publish(&self, entity: &RawEntity) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO entities (id, entity_type, body, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                entity_type = excluded.entity_type,
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(&entity.id)
        .bind(&entity.entity_type)
        .bind(entity.body.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(entity_id = %entity.id, entity_type = %entity.entity_type, "Entity published");
        Ok(())
    }
}
