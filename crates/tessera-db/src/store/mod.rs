//! # Entity Store
//!
//! The local store of full entity documents, behind one trait so the
//! backend can be chosen at startup.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  StoreBackend (config)          open_store()        Arc<dyn EntityStore>│
//! │  ──────────────────────         ────────────        ────────────────────│
//! │  "sqlite"  ────────────────────►  SqliteEntityStore (entities table)    │
//! │  "memory"  ────────────────────►  MemoryEntityStore (process memory)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `publish` is an upsert: applying the same document twice leaves the
//! store unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_core::RawEntity;

use crate::error::DbResult;
use crate::pool::Database;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryEntityStore;
pub use sqlite::SqliteEntityStore;

/// Access to the node's entity documents.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// All entities of a type, ordered by id.
    async fn list_by_type(&self, entity_type: &str) -> DbResult<Vec<RawEntity>>;

    /// Entities with the given ids. Unknown ids are skipped.
    async fn get_by_ids(&self, ids: &[String]) -> DbResult<Vec<RawEntity>>;

    /// Inserts or replaces an entity.
    async fn publish(&self, entity: &RawEntity) -> DbResult<()>;
}

/// Which [`EntityStore`] implementation backs the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "db" => Ok(StoreBackend::Sqlite),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            _ => Err(format!("Unknown store backend: {}", s)),
        }
    }
}

/// Builds the configured store backend.
pub fn open_store(backend: StoreBackend, db: &Database) -> Arc<dyn EntityStore> {
    info!(%backend, "Opening entity store");
    match backend {
        StoreBackend::Sqlite => Arc::new(db.entities()),
        StoreBackend::Memory => Arc::new(MemoryEntityStore::new()),
    }
}
