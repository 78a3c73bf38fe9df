//! # tessera-core: Pure Synchronization Rules
//!
//! Every decision the sync engine makes, expressed as pure functions with
//! zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tessera Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              tessera-node (binary) / peer HTTP server           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   tessera-sync: orchestrator, negotiation, ledger catch-up      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tessera-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐   │   │
//! │  │   │   types   │  │  policy   │  │ integrity │  │ reconcile │   │   │
//! │  │   │  Summary  │  │ eligible? │  │  sha-256  │  │  create/  │   │   │
//! │  │   │  Audit    │  │           │  │ hashlink  │  │  update   │   │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          tessera-db: audit ledger, entity store backends        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Summaries, notifications, audit records
//! - [`policy`] - Replication eligibility filter
//! - [`integrity`] - Content hashes, hashlinks, integrity gate
//! - [`reconcile`] - Local vs. remote delta computation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use tessera_core::policy::ReplicationPolicy;
//! use tessera_core::types::ReplicationEligibility;
//!
//! let policy = ReplicationPolicy::default();
//! let entity = ReplicationEligibility {
//!     id: "urn:PO:1".into(),
//!     lifecycle_status: Some("Launched".into()),
//!     valid_from: None,
//!     valid_to: None,
//! };
//! assert!(policy.is_eligible(&entity, Utc::now()));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod integrity;
pub mod policy;
pub mod reconcile;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{CoreError, CoreResult, PolicyDecisionError};
pub use policy::ReplicationPolicy;
pub use types::{
    AuditRecord, AuditStatus, ChangeNotification, EntitySummary, NegotiationResult,
    PeerIdentity, RawEntity, ReplicationEligibility, SyncSource,
};
