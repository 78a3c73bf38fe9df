//! # Error Types
//!
//! Domain-specific error types for tessera-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tessera-core errors (this file)                                        │
//! │  ├── CoreError        - Rule failures (integrity, policy, parsing)      │
//! │  └── PolicyDecisionError - Unreadable lifecycle attributes              │
//! │                                                                         │
//! │  tessera-db errors (separate crate)                                     │
//! │  └── DbError          - Ledger / store failures                         │
//! │                                                                         │
//! │  tessera-sync errors (separate crate)                                   │
//! │  ├── SyncError        - Engine failures                                 │
//! │  └── NegotiationFailure - Per-peer protocol failures                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by the pure sync rules.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Recomputed content hash does not match the claimed one.
    ///
    /// ## When This Occurs
    /// - Origin served a different revision than the one announced
    /// - Entity body was altered in transit
    /// - Peer summary is stale relative to what the peer now serves
    #[error("Integrity check failed for {entity_id}: expected {expected}, computed {actual}")]
    Integrity {
        entity_id: String,
        expected: String,
        actual: String,
    },

    /// Entity document could not be interpreted.
    #[error("Malformed entity: {0}")]
    MalformedEntity(String),

    /// Policy could not reach a decision (wraps PolicyDecisionError).
    #[error("Policy decision error: {0}")]
    Policy(#[from] PolicyDecisionError),
}

impl CoreError {
    /// Creates a MalformedEntity error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        CoreError::MalformedEntity(reason.into())
    }

    /// Returns true if this error is an integrity mismatch.
    pub fn is_integrity(&self) -> bool {
        matches!(self, CoreError::Integrity { .. })
    }
}

// =============================================================================
// Policy Decision Error
// =============================================================================

/// The replication policy could not evaluate an entity's attributes.
///
/// Callers treat the entity as not eligible.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyDecisionError {
    /// A validity bound is not an ISO-8601 timestamp.
    #[error("Entity {entity_id}: unparseable {field} '{value}'")]
    InvalidDate {
        entity_id: String,
        field: &'static str,
        value: String,
    },
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_message() {
        let err = CoreError::Integrity {
            entity_id: "urn:PO:1".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.is_integrity());
        assert_eq!(
            err.to_string(),
            "Integrity check failed for urn:PO:1: expected aa, computed bb"
        );
    }

    #[test]
    fn test_policy_error_wraps() {
        let err: CoreError = PolicyDecisionError::InvalidDate {
            entity_id: "urn:PO:1".into(),
            field: "validFrom",
            value: "yesterday".into(),
        }
        .into();
        assert!(!err.is_integrity());
        assert!(err.to_string().contains("unparseable validFrom"));
    }
}
