//! In-process entity store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tessera_core::RawEntity;

use super::EntityStore;
use crate::error::DbResult;

/// Entity store kept in process memory. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<BTreeMap<String, RawEntity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-loaded with entities.
    pub fn with_entities(entities: impl IntoIterator<Item = RawEntity>) -> Self {
        MemoryEntityStore {
            entities: RwLock::new(entities.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<RawEntity> {
        self.entities.read().await.get(id).cloned()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn list_by_type(&self, entity_type: &str) -> DbResult<Vec<RawEntity>> {
        Ok(self
            .entities
            .read()
            .await
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn get_by_ids(&self, ids: &[String]) -> DbResult<Vec<RawEntity>> {
        let entities = self.entities.read().await;
        Ok(ids.iter().filter_map(|id| entities.get(id).cloned()).collect())
    }

    async fn publish(&self, entity: &RawEntity) -> DbResult<()> {
        self.entities
            .write()
            .await
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }
}
