//! # Replication Policy
//!
//! Decides whether an entity may leave (or enter) this node.
//!
//! ## Rule
//! ```text
//! eligible(e, now) ⇔ e.lifecycleStatus ∈ allowed
//!                   ∧ (e.validFrom unset ∨ e.validFrom ≤ now)
//!                   ∧ (e.validTo   unset ∨ e.validTo   ≥ now)
//! ```
//!
//! The decision is a pure function of the entity and the supplied clock
//! value. An unreadable date yields a [`PolicyDecisionError`] from
//! [`ReplicationPolicy::decide`]; the boolean helpers treat that case as
//! "not eligible".

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::PolicyDecisionError;
use crate::types::ReplicationEligibility;

/// Lifecycle status replicated when nothing else is configured.
pub const DEFAULT_ALLOWED_STATUS: &str = "Launched";

/// Allow-set based replication policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPolicy {
    allowed_statuses: BTreeSet<String>,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        ReplicationPolicy::new([DEFAULT_ALLOWED_STATUS])
    }
}

impl ReplicationPolicy {
    /// Creates a policy replicating the given lifecycle statuses.
    pub fn new<I, S>(allowed_statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReplicationPolicy {
            allowed_statuses: allowed_statuses.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allowed_statuses(&self) -> impl Iterator<Item = &str> {
        self.allowed_statuses.iter().map(String::as_str)
    }

    /// Evaluates the policy for one entity.
    ///
    /// ## Errors
    /// `PolicyDecisionError::InvalidDate` when a validity bound is set but
    /// cannot be parsed.
    pub fn decide(
        &self,
        entity: &ReplicationEligibility,
        now: DateTime<Utc>,
    ) -> Result<bool, PolicyDecisionError> {
        let status_allowed = entity
            .lifecycle_status
            .as_deref()
            .map(|status| self.allowed_statuses.contains(status))
            .unwrap_or(false);

        let valid_from = parse_bound(&entity.id, "validFrom", entity.valid_from.as_deref())?;
        let valid_to = parse_bound(&entity.id, "validTo", entity.valid_to.as_deref())?;

        if !status_allowed {
            return Ok(false);
        }

        let started = valid_from.map_or(true, |from| from <= now);
        let not_expired = valid_to.map_or(true, |to| to >= now);

        Ok(started && not_expired)
    }

    /// Evaluates the policy, failing closed on undecidable input.
    pub fn is_eligible(&self, entity: &ReplicationEligibility, now: DateTime<Utc>) -> bool {
        self.decide(entity, now).unwrap_or(false)
    }

    /// Returns the ids of the eligible entities.
    ///
    /// Every entity is judged independently; input order does not matter.
    pub fn filter_eligible<'a, I>(&self, entities: I, now: DateTime<Utc>) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a ReplicationEligibility>,
    {
        entities
            .into_iter()
            .filter(|entity| self.is_eligible(entity, now))
            .map(|entity| entity.id.clone())
            .collect()
    }
}

/// Parses an optional ISO-8601 bound. Blank strings count as unset.
fn parse_bound(
    entity_id: &str,
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, PolicyDecisionError> {
    let raw = match value.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(raw) => raw,
    };

    parse_timestamp(raw)
        .map(Some)
        .ok_or_else(|| PolicyDecisionError::InvalidDate {
            entity_id: entity_id.to_string(),
            field,
            value: raw.to_string(),
        })
}

/// Parses RFC 3339, or a zone-less date-time / date read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Tests
// =============================================================================
