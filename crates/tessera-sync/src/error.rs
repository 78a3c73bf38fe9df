//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Negotiation   │  │      Ledger             │ │
//! │  │                 │  │ (per peer)      │  │                         │ │
//! │  │  InvalidConfig  │  │  ClientError    │  │  LedgerUnavailable      │ │
//! │  │  InvalidUrl     │  │  ServerError    │  │  DeserializationFailed  │ │
//! │  │  ConfigLoad     │  │  Unexpected     │  │  RetrievalFailed        │ │
//! │  └─────────────────┘  │  Transport ↻    │  └─────────────────────────┘ │
//! │                       └─────────────────┘                               │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Integrity     │  │    Database     │  │      Auth               │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  hash mismatch  │  │  DatabaseError  │  │  TokenInvalid           │ │
//! │  │  InvalidEntity  │  │                 │  │  TokenMintFailed        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ↻ = retried (fixed delay), everything else is terminal for its scope   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Negotiation Failure
// =============================================================================

/// Failure of one conversation with one peer.
///
/// Only [`NegotiationFailure::Transport`] is retried; a peer that answered
/// with an error status has made its decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationFailure {
    /// Peer answered 4xx.
    #[error("Peer {peer} rejected the request ({status}): {body}")]
    ClientError {
        peer: String,
        status: u16,
        body: String,
    },

    /// Peer answered 5xx.
    #[error("Peer {peer} failed ({status}): {body}")]
    ServerError {
        peer: String,
        status: u16,
        body: String,
    },

    /// Peer answered with a status that is neither success nor error.
    #[error("Unexpected status {status} from peer {peer}")]
    UnexpectedStatus { peer: String, status: u16 },

    /// Connection refused, reset, timed out or DNS failure.
    #[error("Transport failure talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    /// Peer answered 2xx but the payload could not be read.
    #[error("Malformed response from peer {peer}: {reason}")]
    MalformedResponse { peer: String, reason: String },

    /// No bearer token could be minted for the call.
    #[error("Cannot mint token for {peer}: {reason}")]
    Token { peer: String, reason: String },
}

impl NegotiationFailure {
    /// Classifies a non-success HTTP status.
    pub fn from_status(peer: impl Into<String>, status: u16, body: String) -> Self {
        let peer = peer.into();
        match status {
            400..=499 => NegotiationFailure::ClientError { peer, status, body },
            500..=599 => NegotiationFailure::ServerError { peer, status, body },
            _ => NegotiationFailure::UnexpectedStatus { peer, status },
        }
    }

    /// Returns true if the same request may be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NegotiationFailure::Transport { .. })
    }

    /// The peer this failure belongs to.
    pub fn peer(&self) -> &str {
        match self {
            NegotiationFailure::ClientError { peer, .. }
            | NegotiationFailure::ServerError { peer, .. }
            | NegotiationFailure::UnexpectedStatus { peer, .. }
            | NegotiationFailure::Transport { peer, .. }
            | NegotiationFailure::MalformedResponse { peer, .. }
            | NegotiationFailure::Token { peer, .. } => peer,
        }
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid URL in configuration or a notification.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Peer Errors
    // =========================================================================
    /// A peer conversation failed.
    #[error(transparent)]
    Negotiation(#[from] NegotiationFailure),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Retrieved entity does not match its announced hash.
    #[error("Integrity check failed for {entity_id}: expected {expected}, computed {actual}")]
    IntegrityFailure {
        entity_id: String,
        expected: String,
        actual: String,
    },

    /// Entity document could not be interpreted.
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    // =========================================================================
    // Ledger Errors
    // =========================================================================
    /// Ledger adapter could not be queried.
    #[error("Ledger adapter unavailable: {0}")]
    LedgerUnavailable(String),

    /// Ledger response could not be decoded.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Entity could not be fetched from its data location.
    #[error("Failed to retrieve {entity_id}: {reason}")]
    RetrievalFailed { entity_id: String, reason: String },

    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// Bearer token rejected.
    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// Bearer token could not be created.
    #[error("Failed to mint token: {0}")]
    TokenMintFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Ledger or store operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Server could not bind its listener.
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tessera_db::DbError> for SyncError {
    fn from(err: tessera_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<tessera_core::CoreError> for SyncError {
    fn from(err: tessera_core::CoreError) -> Self {
        match err {
            tessera_core::CoreError::Integrity {
                entity_id,
                expected,
                actual,
            } => SyncError::IntegrityFailure {
                entity_id,
                expected,
                actual,
            },
            other => SyncError::InvalidEntity(other.to_string()),
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        SyncError::TokenInvalid(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the failed operation can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Negotiation(failure) => failure.is_retryable(),
            SyncError::LedgerUnavailable(_) | SyncError::RetrievalFailed { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if an entity was rejected by the integrity gate.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, SyncError::IntegrityFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            NegotiationFailure::from_status("p", 403, "no".into()),
            NegotiationFailure::ClientError { status: 403, .. }
        ));
        assert!(matches!(
            NegotiationFailure::from_status("p", 502, "bad gateway".into()),
            NegotiationFailure::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            NegotiationFailure::from_status("p", 304, String::new()),
            NegotiationFailure::UnexpectedStatus { status: 304, .. }
        ));
    }

    #[test]
    fn test_only_transport_is_retryable() {
        let transport = NegotiationFailure::Transport {
            peer: "p".into(),
            reason: "connection refused".into(),
        };
        assert!(transport.is_retryable());
        assert!(!NegotiationFailure::from_status("p", 400, String::new()).is_retryable());
        assert!(!NegotiationFailure::from_status("p", 500, String::new()).is_retryable());
        assert_eq!(transport.peer(), "p");

        let wrapped: SyncError = transport.into();
        assert!(wrapped.is_retryable());
    }

    #[test]
    fn test_core_integrity_maps_to_integrity_failure() {
        let err: SyncError = tessera_core::CoreError::Integrity {
            entity_id: "urn:PO:1".into(),
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(err.is_integrity_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidConfig("x".into()).is_config_error());
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
        assert!(!SyncError::DatabaseError("x".into()).is_config_error());
    }
}
