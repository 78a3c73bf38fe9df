//! # tessera-sync: Sync Engine for Tessera
//!
//! Keeps a node's entity store consistent with its peers and with the
//! distributed ledger, recording every applied change in the audit ledger.
//!
//! ## Two Channels
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncOrchestrator                                │
//! │                                                                         │
//! │   PEER CHANNEL (every 10 min)          LEDGER CHANNEL (every 60 s)      │
//! │   ───────────────────────────          ─────────────────────────────    │
//! │   LocalCatalog ─► summaries            latest_checkpoint()              │
//! │        │                                    │                           │
//! │        ▼                                    ▼                           │
//! │   HttpPeerClient::exchange ×N          LedgerAdapter::range_query       │
//! │        │                                    │                           │
//! │        ▼                                    ▼                           │
//! │   NegotiationEngine                    LedgerCatchupWorker              │
//! │   reconcile ─► fetch ─► verify         batch(50) ─► retrieve ─► verify  │
//! │        │                                    │                           │
//! │        └────────────┬───────────────────────┘                           │
//! │                     ▼                                                   │
//! │        RETRIEVED ─► EntityStore::publish ─► PUBLISHED (AuditLedger)     │
//! │                                                                         │
//! │   PeerServer answers the other side of the peer channel.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - `NodeConfig` (TOML + environment)
//! - [`error`] - `SyncError` and `NegotiationFailure`
//! - [`token`] - Bearer tokens for peer calls
//! - [`protocol`] - Paths, headers, NDJSON framing
//! - [`client`] - Outbound peer calls with retry
//! - [`server`] - Inbound peer protocol (axum)
//! - [`catalog`] - Eligible local summaries and documents
//! - [`negotiation`] - Per-peer reconciliation and apply
//! - [`ledger`] / [`retriever`] - Ledger adapter and origin fetch
//! - [`catchup`] - Checkpointed ledger replay
//! - [`orchestrator`] - Scheduling of both channels
//!
//! ## Usage
//!
//! ```rust,ignore
//! let config = NodeConfig::load_or_default(None);
//! let orchestrator = Arc::new(SyncOrchestrator::new(settings, catalog, gateway, engine, catchup));
//!
//! let report = orchestrator.synchronize("manual-run").await;
//! println!("published {}", report.published());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod catalog;
pub mod catchup;
pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod negotiation;
pub mod orchestrator;
pub mod protocol;
pub mod retriever;
pub mod server;
pub mod token;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use catalog::LocalCatalog;
pub use catchup::{CatchupReport, LedgerCatchupWorker};
pub use client::{HttpPeerClient, PeerGateway, RetryPolicy, SummaryStream};
pub use config::NodeConfig;
pub use error::{NegotiationFailure, SyncError, SyncResult};
pub use ledger::{HttpLedgerAdapter, LedgerAdapter};
pub use negotiation::{NegotiationEngine, PeerOutcome, PeerReport};
pub use orchestrator::{
    OrchestratorHandle, OrchestratorSettings, SyncOrchestrator, SyncReport, TypeReport,
};
pub use retriever::{EntityRetriever, HttpEntityRetriever};
pub use server::{PeerServer, ServerHandle, ServerState};
pub use token::{JwtTokenService, PeerClaims, TokenService};
