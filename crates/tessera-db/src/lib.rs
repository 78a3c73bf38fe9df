//! # tessera-db: Persistence Layer for Tessera
//!
//! The append-only audit ledger and the local entity store, both on SQLite
//! through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tessera Data Flow                                │
//! │                                                                         │
//! │  tessera-sync (negotiation engine, catch-up worker, peer server)        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tessera-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐   │   │
//! │  │   │   Database    │    │  AuditLedger  │    │ EntityStore  │   │   │
//! │  │   │   (pool.rs)   │    │ (repository/) │    │   (store/)   │   │   │
//! │  │   │               │    │               │    │              │   │   │
//! │  │   │ SqlitePool    │◄───│ AuditRepo     │    │ sqlite       │   │   │
//! │  │   │ Migrations    │    │ append-only   │    │ memory       │   │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Audit ledger
//! - [`store`] - Entity store trait, backends and factory
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_db::{open_store, AuditLedger, Database, DbConfig, StoreBackend};
//!
//! let db = Database::new(DbConfig::new("node.db")).await?;
//! let store = open_store(StoreBackend::Sqlite, &db);
//! let checkpoint = db.audit().latest_checkpoint().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::audit::{AuditLedger, AuditRepository};
pub use store::{open_store, EntityStore, MemoryEntityStore, SqliteEntityStore, StoreBackend};
