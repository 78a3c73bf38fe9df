//! # Delta Reconciliation
//!
//! Compares the local view of one entity type with a peer's view and
//! decides what to pull.
//!
//! ## Decision Table
//! ```text
//! ┌──────────────────────────────┬───────────────────────────────┐
//! │ Remote summary               │ Outcome                       │
//! ├──────────────────────────────┼───────────────────────────────┤
//! │ other entity type            │ ignored                       │
//! │ fails replication policy     │ ignored                       │
//! │ id unknown locally           │ create                        │
//! │ newer than local copy        │ update                        │
//! │ same or older                │ ignored                       │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## "Newer"
//! 1. Higher version wins (dot-separated, numeric segments compared as numbers)
//! 2. Same version: later `lastUpdate` wins
//! 3. Same version and `lastUpdate` but different content: the
//!    lexicographically greater content hash wins, so every node converges
//!    on the same revision

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::policy::{parse_timestamp, ReplicationPolicy};
use crate::types::{EntitySummary, NegotiationResult};

/// Compares two version strings segment by segment.
///
/// Missing trailing segments count as zero (`1.2 == 1.2.0`). A leading `v`
/// is ignored. Non-numeric segments fall back to string order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<&str> = split_version(a);
    let b_parts: Vec<&str> = split_version(b);
    let len = a_parts.len().max(b_parts.len());

    for i in 0..len {
        let left = a_parts.get(i).copied().unwrap_or("0");
        let right = b_parts.get(i).copied().unwrap_or("0");

        let ord = match (left.parse::<u64>(), right.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => left.cmp(right),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn split_version(v: &str) -> Vec<&str> {
    let v = v.trim();
    let v = v.strip_prefix(['v', 'V']).unwrap_or(v);
    if v.is_empty() {
        return Vec::new();
    }
    v.split('.').collect()
}

fn compare_last_update(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (parse_timestamp(a), parse_timestamp(b)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => a.cmp(b),
        },
    }
}

/// Returns true when `remote` should replace `local`.
pub fn is_newer(remote: &EntitySummary, local: &EntitySummary) -> bool {
    compare_versions(&remote.version, &local.version)
        .then_with(|| {
            compare_last_update(remote.last_update.as_deref(), local.last_update.as_deref())
        })
        .then_with(|| remote.content_hash.cmp(&local.content_hash))
        == Ordering::Greater
}

/// Reconciles one peer's summaries against the local summaries of a type.
///
/// `local` is keyed by entity id. Duplicate remote ids collapse to the
/// newest summary.
pub fn reconcile<I>(
    entity_type: &str,
    local: &HashMap<String, EntitySummary>,
    remote: I,
    policy: &ReplicationPolicy,
    now: DateTime<Utc>,
) -> NegotiationResult
where
    I: IntoIterator<Item = EntitySummary>,
{
    let mut result = NegotiationResult::default();
    let mut candidates: HashMap<String, EntitySummary> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for summary in remote {
        if summary.entity_type != entity_type || !policy.is_eligible(&summary.eligibility(), now) {
            result.ignored.push(summary.id);
            continue;
        }

        match candidates.get(&summary.id) {
            Some(existing) if !is_newer(&summary, existing) => continue,
            Some(_) => {}
            None => order.push(summary.id.clone()),
        }
        candidates.insert(summary.id.clone(), summary);
    }

    for id in order {
        let Some(remote) = candidates.remove(&id) else {
            continue;
        };
        match local.get(&id) {
            None => result.create.push(remote),
            Some(local) if is_newer(&remote, local) => result.update.push(remote),
            Some(_) => result.ignored.push(id),
        }
    }

    result
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PO: &str = "product-offering";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn summary(id: &str, version: &str, last_update: &str, hash: &str) -> EntitySummary {
        EntitySummary {
            id: id.to_string(),
            entity_type: PO.to_string(),
            version: version.to_string(),
            last_update: Some(last_update.to_string()),
            lifecycle_status: Some("Launched".to_string()),
            valid_from: None,
            valid_to: None,
            content_hash: hash.to_string(),
            hashlink: None,
        }
    }

    fn local_map(items: Vec<EntitySummary>) -> HashMap<String, EntitySummary> {
        items.into_iter().map(|s| (s.id.clone(), s)).collect()
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2", "1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("v2", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("", "0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0-beta", "1.0-alpha"), Ordering::Greater);
    }

    #[test]
    fn test_newer_version_is_update() {
        let local = local_map(vec![summary("urn:PO:1", "1.0", "2024-01-01T00:00:00Z", "aa")]);
        let remote = vec![summary("urn:PO:1", "1.2", "2024-01-01T00:00:00Z", "bb")];

        let result = reconcile(PO, &local, remote, &ReplicationPolicy::default(), now());

        assert!(result.create.is_empty());
        assert_eq!(result.update.len(), 1);
        assert_eq!(result.update[0].version, "1.2");
        assert_eq!(result.fetch_count(), 1);
    }

    #[test]
    fn test_unknown_id_is_create() {
        let local = local_map(vec![]);
        let remote = vec![summary("urn:PO:9", "1.0", "2024-01-01T00:00:00Z", "aa")];

        let result = reconcile(PO, &local, remote, &ReplicationPolicy::default(), now());

        assert_eq!(result.create.len(), 1);
        assert!(result.update.is_empty());
    }

    #[test]
    fn test_older_or_equal_is_ignored() {
        let local = local_map(vec![
            summary("urn:PO:1", "2.0", "2024-03-01T00:00:00Z", "aa"),
            summary("urn:PO:2", "1.0", "2024-03-01T00:00:00Z", "cc"),
        ]);
        let remote = vec![
            summary("urn:PO:1", "1.5", "2024-05-01T00:00:00Z", "bb"),
            summary("urn:PO:2", "1.0", "2024-03-01T00:00:00Z", "cc"),
        ];

        let result = reconcile(PO, &local, remote, &ReplicationPolicy::default(), now());

        assert!(result.is_empty());
        assert_eq!(result.ignored.len(), 2);
    }

    #[test]
    fn test_same_version_later_update_wins() {
        let local = local_map(vec![summary("urn:PO:1", "1.0", "2024-03-01T00:00:00Z", "aa")]);
        let remote = vec![summary("urn:PO:1", "1.0", "2024-03-02T00:00:00Z", "bb")];

        let result = reconcile(PO, &local, remote, &ReplicationPolicy::default(), now());
        assert_eq!(result.update.len(), 1);
    }

    #[test]
    fn test_hash_tiebreak_converges() {
        let a = summary("urn:PO:1", "1.0", "2024-03-01T00:00:00Z", "aaaa");
        let b = summary("urn:PO:1", "1.0", "2024-03-01T00:00:00Z", "bbbb");

        // Exactly one direction pulls.
        assert!(is_newer(&b, &a));
        assert!(!is_newer(&a, &b));
    }

    #[test]
    fn test_other_type_and_ineligible_are_ignored() {
        let local = local_map(vec![]);
        let mut other_type = summary("urn:C:1", "1.0", "2024-01-01T00:00:00Z", "aa");
        other_type.entity_type = "category".into();
        let mut retired = summary("urn:PO:3", "1.0", "2024-01-01T00:00:00Z", "bb");
        retired.lifecycle_status = Some("Retired".into());

        let result = reconcile(
            PO,
            &local,
            vec![other_type, retired],
            &ReplicationPolicy::default(),
            now(),
        );

        assert!(result.is_empty());
        assert_eq!(result.ignored, vec!["urn:C:1".to_string(), "urn:PO:3".to_string()]);
    }

    #[test]
    fn test_duplicate_remote_ids_keep_newest() {
        let local = local_map(vec![]);
        let remote = vec![
            summary("urn:PO:1", "1.0", "2024-01-01T00:00:00Z", "aa"),
            summary("urn:PO:1", "1.3", "2024-01-01T00:00:00Z", "bb"),
            summary("urn:PO:1", "1.1", "2024-01-01T00:00:00Z", "cc"),
        ];

        let result = reconcile(PO, &local, remote, &ReplicationPolicy::default(), now());

        assert_eq!(result.create.len(), 1);
        assert_eq!(result.create[0].version, "1.3");
    }
}
