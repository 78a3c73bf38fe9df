//! # Integrity Verification
//!
//! Content hashing and the integrity gate every retrieved entity passes
//! before it may be published.
//!
//! ## Hashing Rules
//! ```text
//! content_hash(entity) = hex(sha256(canonical JSON))
//!                         canonical = object keys sorted, no whitespace
//!
//! hashlink(prev, hash)  = hash                          (first revision)
//!                       = hex(sha256(prev ‖ hash))      (every later one)
//! ```
//!
//! Two nodes holding the same document always compute the same hash, no
//! matter the key order in which the document arrived.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Computes the canonical content hash of an entity document.
pub fn content_hash(entity: &Value) -> String {
    // serde_json's default map is ordered by key, so Display is canonical.
    sha256_hex(entity.to_string().as_bytes())
}

/// Chains a content hash onto the previous hashlink of the same entity.
pub fn hashlink(previous: Option<&str>, content_hash: &str) -> String {
    match previous {
        Some(prev) if !prev.is_empty() => {
            let mut hasher = Sha256::new();
            hasher.update(prev.as_bytes());
            hasher.update(content_hash.as_bytes());
            hex::encode(hasher.finalize())
        }
        _ => content_hash.to_string(),
    }
}

/// Checks that `entity` hashes to `claimed_hash`.
///
/// ## Errors
/// `CoreError::Integrity` on mismatch. Hex case is ignored.
pub fn verify(entity_id: &str, claimed_hash: &str, entity: &Value) -> CoreResult<()> {
    let actual = content_hash(entity);
    if actual.eq_ignore_ascii_case(claimed_hash.trim()) {
        Ok(())
    } else {
        Err(CoreError::Integrity {
            entity_id: entity_id.to_string(),
            expected: claimed_hash.to_string(),
            actual,
        })
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// =============================================================================
// Tests
// =============================================================================
