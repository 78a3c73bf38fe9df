//! # Repository Module
//!
//! Database repository implementations for the node.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Access                                    │
//! │                                                                         │
//! │  Catch-up worker / negotiation engine                                   │
//! │       │                                                                 │
//! │       │  db.audit().latest_checkpoint()                                 │
//! │       ▼                                                                 │
//! │  AuditRepository (implements AuditLedger)                               │
//! │  ├── record(&self, record)              append only                     │
//! │  ├── latest_by_entity(&self, id, statuses)                              │
//! │  ├── latest_checkpoint(&self)                                           │
//! │  ├── latest_for_entities(&self, ids)                                    │
//! │  ├── history(&self, id)                                                 │
//! │  └── count_by_status(&self, status, source)                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite audit_records                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`audit::AuditRepository`] - Append-only audit ledger

pub mod audit;
