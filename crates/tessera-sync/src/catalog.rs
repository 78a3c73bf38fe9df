//! # Local Catalog
//!
//! What this node holds and what it is willing to share.
//!
//! - [`LocalCatalog::index`] summarizes every stored entity of a type. It is
//!   the baseline negotiation compares remote summaries against, so a
//!   retired or expired local revision still counts as present.
//! - [`LocalCatalog::advertised`] / [`LocalCatalog::summaries`] keep only the
//!   replication-eligible part, which is what peers get to see.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use tessera_core::{EntitySummary, ReplicationEligibility, ReplicationPolicy};
use tessera_db::{AuditLedger, EntityStore};

use crate::error::SyncResult;

/// View over the store, split by the replication policy.
#[derive(Clone)]
pub struct LocalCatalog {
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditLedger>,
    policy: ReplicationPolicy,
}

impl LocalCatalog {
    pub fn new(
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditLedger>,
        policy: ReplicationPolicy,
    ) -> Self {
        LocalCatalog {
            store,
            audit,
            policy,
        }
    }

    pub fn policy(&self) -> &ReplicationPolicy {
        &self.policy
    }

    /// Summaries of every stored entity of one type, eligible or not.
    ///
    /// Hashlinks are taken from the audit ledger.
    pub async fn index(&self, entity_type: &str) -> SyncResult<Vec<EntitySummary>> {
        let entities = self.store.list_by_type(entity_type).await?;

        let ids: Vec<String> = entities.iter().map(|e| e.id.clone()).collect();
        let mut latest = self.audit.latest_for_entities(&ids).await?;

        Ok(entities
            .iter()
            .map(|entity| {
                let hashlink = latest.remove(&entity.id).and_then(|record| record.hashlink);
                entity.summarize(hashlink)
            })
            .collect())
    }

    /// The replication-eligible part of an index.
    pub fn advertised(&self, index: &[EntitySummary]) -> Vec<EntitySummary> {
        let eligible = self.eligible_ids(index.iter().map(EntitySummary::eligibility).collect());

        index
            .iter()
            .filter(|summary| eligible.contains(&summary.id))
            .cloned()
            .collect()
    }

    /// Eligible summaries of one type.
    pub async fn summaries(&self, entity_type: &str) -> SyncResult<Vec<EntitySummary>> {
        let index = self.index(entity_type).await?;
        let advertised = self.advertised(&index);

        debug!(
            entity_type,
            total = index.len(),
            eligible = advertised.len(),
            "Local summaries built"
        );
        Ok(advertised)
    }

    /// Full documents for the requested ids, eligible ones only.
    pub async fn eligible_entities(&self, ids: &[String]) -> SyncResult<Vec<Value>> {
        let entities = self.store.get_by_ids(ids).await?;
        let eligible = self.eligible_ids(entities.iter().map(|e| e.eligibility()).collect());

        Ok(entities
            .into_iter()
            .filter(|entity| eligible.contains(&entity.id))
            .map(|entity| entity.body)
            .collect())
    }

    /// Runs the batch filter and logs the entities it could not decide on.
    fn eligible_ids(&self, candidates: Vec<ReplicationEligibility>) -> HashSet<String> {
        let now = Utc::now();
        let eligible = self.policy.filter_eligible(&candidates, now);

        for candidate in candidates.iter().filter(|c| !eligible.contains(&c.id)) {
            if let Err(e) = self.policy.decide(candidate, now) {
                warn!(entity_id = %candidate.id, error = %e, "Policy undecidable, not replicating");
            }
        }
        eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{AuditRecord, AuditStatus, RawEntity, SyncSource};
    use tessera_db::{Database, DbConfig, MemoryEntityStore};

    fn entity(id: &str, status: &str, valid_to: Option<&str>) -> RawEntity {
        let mut body = json!({
            "id": id,
            "type": "product-offering",
            "version": {"type": "Property", "value": "1.0"},
            "lifecycleStatus": {"type": "Property", "value": status},
        });
        if let Some(to) = valid_to {
            body["validFor"] = json!({"type": "Property", "value": {"endDateTime": to}});
        }
        RawEntity::from_json(body).unwrap()
    }

    async fn catalog(entities: Vec<RawEntity>) -> (LocalCatalog, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = Arc::new(MemoryEntityStore::with_entities(entities));
        let catalog = LocalCatalog::new(store, Arc::new(db.audit()), ReplicationPolicy::default());
        (catalog, db)
    }

    #[tokio::test]
    async fn test_summaries_only_cover_eligible_entities() {
        let (catalog, _db) = catalog(vec![
            entity("urn:PO:1", "Launched", None),
            entity("urn:PO:2", "Retired", None),
            entity("urn:PO:3", "Launched", Some("2000-01-01T00:00:00Z")),
            entity("urn:PO:4", "Launched", Some("garbage")),
        ])
        .await;

        let summaries = catalog.summaries("product-offering").await.unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["urn:PO:1"]);
        assert_eq!(summaries[0].hashlink.as_ref(), Some(&summaries[0].content_hash));
    }

    #[tokio::test]
    async fn test_index_keeps_ineligible_entities() {
        let (catalog, _db) = catalog(vec![
            entity("urn:PO:1", "Launched", None),
            entity("urn:PO:2", "Retired", None),
        ])
        .await;

        let index = catalog.index("product-offering").await.unwrap();
        let mut ids: Vec<&str> = index.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["urn:PO:1", "urn:PO:2"]);

        let advertised = catalog.advertised(&index);
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].id, "urn:PO:1");
    }

    #[tokio::test]
    async fn test_summary_carries_ledger_hashlink() {
        let offering = entity("urn:PO:1", "Launched", None);
        let (catalog, db) = catalog(vec![offering.clone()]).await;

        let hash = tessera_core::integrity::content_hash(&offering.body);
        db.audit()
            .record(AuditRecord::new(
                "p-1",
                "urn:PO:1",
                "product-offering",
                "older-hash",
                AuditStatus::Published,
                SyncSource::Peer,
            ))
            .await
            .unwrap();
        let latest = db
            .audit()
            .record(AuditRecord::new(
                "p-2",
                "urn:PO:1",
                "product-offering",
                hash,
                AuditStatus::Published,
                SyncSource::Peer,
            ))
            .await
            .unwrap();

        let summaries = catalog.summaries("product-offering").await.unwrap();
        assert_eq!(summaries[0].hashlink, latest.hashlink);
        assert_ne!(summaries[0].hashlink.as_ref(), Some(&summaries[0].content_hash));
    }

    #[tokio::test]
    async fn test_eligible_entities_hides_ineligible() {
        let (catalog, _db) = catalog(vec![
            entity("urn:PO:1", "Launched", None),
            entity("urn:PO:2", "Retired", None),
        ])
        .await;

        let docs = catalog
            .eligible_entities(&["urn:PO:1".to_string(), "urn:PO:2".to_string()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["id"], "urn:PO:1");
    }
}
