//! # Negotiation Engine
//!
//! Turns the summaries received from each peer into applied entities.
//!
//! ## Per-Peer Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  peer A stream ─┐                                                       │
//! │  peer B stream ─┼─► join_all ─► one PeerOutcome per peer                │
//! │  peer C stream ─┘      │                                                │
//! │                        ▼ (each peer independently)                      │
//! │   collect summaries ─► reconcile(local) ─► drop already-published       │
//! │        │                    │                        │                  │
//! │        │            create / update / ignored        ▼                  │
//! │        │                                 fetch_entities (one call)      │
//! │        │                                             │                  │
//! │        │                 ┌───────────────────────────┘                  │
//! │        │                 ▼  per document                                │
//! │        │   verify hash ─► RETRIEVED ─► publish ─► PUBLISHED             │
//! │        │   (mismatch: counted as failed, nothing written)               │
//! │        ▼                                                                │
//! │   stream error ─► that peer's outcome is Err, siblings continue         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::stream::TryStreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use tessera_core::reconcile::reconcile;
use tessera_core::{
    integrity, AuditRecord, AuditStatus, EntitySummary, PeerIdentity, RawEntity,
    ReplicationPolicy, SyncSource,
};
use tessera_db::{AuditLedger, EntityStore};

use crate::client::{PeerGateway, SummaryStream};
use crate::error::SyncResult;

/// Counters for one peer and one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerReport {
    /// Summaries received from the peer.
    pub received: usize,
    /// Remote entities unknown locally.
    pub created: usize,
    /// Remote entities newer than the local copy.
    pub updated: usize,
    /// Remote summaries left alone.
    pub ignored: usize,
    /// Candidates whose exact revision was already published.
    pub skipped: usize,
    pub published: usize,
    pub failed: usize,
}

/// Result of negotiating with one peer.
#[derive(Debug)]
pub struct PeerOutcome {
    pub peer: PeerIdentity,
    pub result: SyncResult<PeerReport>,
}

/// Reconciles peer summaries and applies the resulting changes.
pub struct NegotiationEngine {
    gateway: Arc<dyn PeerGateway>,
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditLedger>,
    policy: ReplicationPolicy,
}

impl NegotiationEngine {
    pub fn new(
        gateway: Arc<dyn PeerGateway>,
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditLedger>,
        policy: ReplicationPolicy,
    ) -> Self {
        NegotiationEngine {
            gateway,
            store,
            audit,
            policy,
        }
    }

    /// Negotiates one entity type with every peer concurrently.
    ///
    /// `local` is every stored entity of the type, eligible or not.
    /// Never fails as a whole: each peer's failure is reported in its own
    /// [`PeerOutcome`]. Outcomes are ordered by peer.
    pub async fn negotiate(
        &self,
        process_id: &str,
        entity_type: &str,
        local: &[EntitySummary],
        remote: HashMap<PeerIdentity, SummaryStream>,
    ) -> Vec<PeerOutcome> {
        let local: HashMap<String, EntitySummary> = local
            .iter()
            .map(|summary| (summary.id.clone(), summary.clone()))
            .collect();

        let tasks = remote.into_iter().map(|(peer, stream)| {
            let local = &local;
            async move {
                let result = self
                    .negotiate_peer(process_id, entity_type, local, &peer, stream)
                    .await;

                match &result {
                    Ok(report) => info!(
                        process_id,
                        peer = %peer,
                        entity_type,
                        received = report.received,
                        published = report.published,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Peer negotiation finished"
                    ),
                    Err(e) => warn!(
                        process_id,
                        peer = %peer,
                        entity_type,
                        error = %e,
                        "Peer negotiation failed"
                    ),
                }

                PeerOutcome { peer, result }
            }
        });

        let mut outcomes = join_all(tasks).await;
        outcomes.sort_by(|a, b| a.peer.cmp(&b.peer));
        outcomes
    }

    async fn negotiate_peer(
        &self,
        process_id: &str,
        entity_type: &str,
        local: &HashMap<String, EntitySummary>,
        peer: &PeerIdentity,
        stream: SummaryStream,
    ) -> SyncResult<PeerReport> {
        let remote: Vec<EntitySummary> = stream.try_collect().await?;

        let mut report = PeerReport {
            received: remote.len(),
            ..PeerReport::default()
        };

        let delta = reconcile(entity_type, local, remote, &self.policy, Utc::now());
        report.created = delta.create.len();
        report.updated = delta.update.len();
        report.ignored = delta.ignored.len();

        debug!(
            process_id,
            peer = %peer,
            entity_type,
            create = report.created,
            update = report.updated,
            ignored = report.ignored,
            "Reconciled peer summaries"
        );

        let mut wanted: HashMap<String, EntitySummary> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for summary in delta.to_fetch() {
            if self
                .already_published(&summary.id, &summary.content_hash)
                .await?
            {
                report.skipped += 1;
                continue;
            }
            order.push(summary.id.clone());
            wanted.insert(summary.id.clone(), summary.clone());
        }

        if order.is_empty() {
            return Ok(report);
        }

        let documents = self
            .gateway
            .fetch_entities(process_id, peer, &order)
            .await?;

        for document in documents {
            match self.apply(process_id, &mut wanted, document).await {
                Ok(Some(entity_id)) => {
                    report.published += 1;
                    debug!(process_id, peer = %peer, entity_id = %entity_id, "Entity applied");
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(process_id, peer = %peer, error = %e, "Entity from peer rejected");
                }
            }
        }

        if !wanted.is_empty() {
            warn!(
                process_id,
                peer = %peer,
                missing = wanted.len(),
                "Peer did not return every requested entity"
            );
            report.failed += wanted.len();
        }

        Ok(report)
    }

    async fn already_published(&self, entity_id: &str, content_hash: &str) -> SyncResult<bool> {
        let latest = self
            .audit
            .latest_by_entity(entity_id, &[AuditStatus::Published])
            .await?;
        Ok(latest.is_some_and(|record| record.content_hash.eq_ignore_ascii_case(content_hash)))
    }

    /// Verifies and stores one fetched document.
    ///
    /// Returns the entity id, or `None` for documents that were not asked for.
    async fn apply(
        &self,
        process_id: &str,
        wanted: &mut HashMap<String, EntitySummary>,
        document: Value,
    ) -> SyncResult<Option<String>> {
        let entity = RawEntity::from_json(document)?;

        let Some(summary) = wanted.remove(&entity.id) else {
            debug!(process_id, entity_id = %entity.id, "Ignoring unrequested entity");
            return Ok(None);
        };

        integrity::verify(&entity.id, &summary.content_hash, &entity.body)?;

        self.audit
            .record(peer_record(process_id, &summary, AuditStatus::Retrieved))
            .await?;

        self.store.publish(&entity).await?;

        self.audit
            .record(peer_record(process_id, &summary, AuditStatus::Published))
            .await?;

        Ok(Some(entity.id))
    }
}

fn peer_record(process_id: &str, summary: &EntitySummary, status: AuditStatus) -> AuditRecord {
    AuditRecord::new(
        process_id,
        summary.id.clone(),
        summary.entity_type.clone(),
        summary.content_hash.clone(),
        status,
        SyncSource::Peer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NegotiationFailure, SyncError};
    use crate::test_support::{offering, summary_of, FakeGateway};
    use futures_util::stream::{self, StreamExt};
    use tessera_db::{Database, DbConfig, MemoryEntityStore};

    struct Fixture {
        engine: NegotiationEngine,
        gateway: Arc<FakeGateway>,
        store: Arc<MemoryEntityStore>,
        db: Database,
    }

    async fn fixture(local: Vec<Value>) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let gateway = Arc::new(FakeGateway::default());
        let store = Arc::new(MemoryEntityStore::with_entities(
            local.into_iter().map(|doc| RawEntity::from_json(doc).unwrap()),
        ));
        let engine = NegotiationEngine::new(
            gateway.clone(),
            store.clone(),
            Arc::new(db.audit()),
            ReplicationPolicy::default(),
        );
        Fixture {
            engine,
            gateway,
            store,
            db,
        }
    }

    fn streams(entries: Vec<(PeerIdentity, Vec<Value>)>) -> HashMap<PeerIdentity, SummaryStream> {
        entries
            .into_iter()
            .map(|(peer, docs)| {
                let summaries: Vec<Result<EntitySummary, NegotiationFailure>> =
                    docs.iter().map(|d| Ok(summary_of(d))).collect();
                (peer, stream::iter(summaries).boxed())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_newer_remote_version_is_fetched_once_and_applied() {
        let local_doc = offering("urn:PO:1", "1.0", "Launched");
        let remote_doc = offering("urn:PO:1", "1.2", "Launched");
        let f = fixture(vec![local_doc.clone()]).await;

        let peer = PeerIdentity::new("https://node-b");
        f.gateway.serve(&peer, vec![remote_doc.clone()]);

        let outcomes = f
            .engine
            .negotiate(
                "p-1",
                "product-offering",
                &[summary_of(&local_doc)],
                streams(vec![(peer.clone(), vec![remote_doc.clone()])]),
            )
            .await;

        let report = outcomes[0].result.as_ref().unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.published, 1);

        let calls = f.gateway.fetch_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, vec!["urn:PO:1".to_string()]);

        assert_eq!(f.store.get("urn:PO:1").await.unwrap().version, "1.2");

        let history = f.db.audit().history("urn:PO:1").await.unwrap();
        let statuses: Vec<AuditStatus> = history.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![AuditStatus::Retrieved, AuditStatus::Published]);
        assert!(history.iter().all(|r| r.source == SyncSource::Peer));
        assert_eq!(history[1].content_hash, summary_of(&remote_doc).content_hash);
    }

    #[tokio::test]
    async fn test_tampered_document_is_not_published() {
        let f = fixture(vec![]).await;
        let peer = PeerIdentity::new("https://node-b");

        let advertised = offering("urn:PO:2", "1.0", "Launched");
        let mut tampered = advertised.clone();
        tampered["version"]["value"] = "9.9".into();
        f.gateway.override_documents(&peer, vec![tampered]);

        let outcomes = f
            .engine
            .negotiate(
                "p-1",
                "product-offering",
                &[],
                streams(vec![(peer, vec![advertised])]),
            )
            .await;

        let report = outcomes[0].result.as_ref().unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.published, 0);
        assert_eq!(report.failed, 1);
        assert!(f.store.is_empty().await);
        assert!(f.db.audit().history("urn:PO:2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_stream_only_fails_its_peer() {
        let f = fixture(vec![]).await;
        let good = PeerIdentity::new("https://node-b");
        let bad = PeerIdentity::new("https://node-c");

        let doc = offering("urn:PO:3", "1.0", "Launched");
        f.gateway.serve(&good, vec![doc.clone()]);

        let mut remote = streams(vec![(good.clone(), vec![doc.clone()])]);
        let broken: Vec<Result<EntitySummary, NegotiationFailure>> = vec![
            Ok(summary_of(&doc)),
            Err(NegotiationFailure::Transport {
                peer: bad.to_string(),
                reason: "connection reset".into(),
            }),
        ];
        remote.insert(bad.clone(), stream::iter(broken).boxed());

        let outcomes = f
            .engine
            .negotiate("p-1", "product-offering", &[], remote)
            .await;

        assert_eq!(outcomes.len(), 2);
        let by_peer: HashMap<&PeerIdentity, &SyncResult<PeerReport>> =
            outcomes.iter().map(|o| (&o.peer, &o.result)).collect();
        assert_eq!(by_peer[&good].as_ref().unwrap().published, 1);
        assert!(matches!(by_peer[&bad], Err(SyncError::Negotiation(_))));

        // Only the healthy peer was asked for documents.
        assert_eq!(f.gateway.fetch_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_already_published_revision_is_skipped() {
        let f = fixture(vec![]).await;
        let peer = PeerIdentity::new("https://node-b");
        let doc = offering("urn:PO:4", "1.0", "Launched");
        f.gateway.serve(&peer, vec![doc.clone()]);

        let first = f
            .engine
            .negotiate(
                "p-1",
                "product-offering",
                &[],
                streams(vec![(peer.clone(), vec![doc.clone()])]),
            )
            .await;
        assert_eq!(first[0].result.as_ref().unwrap().published, 1);

        // Same revision offered again against a stale local view.
        let second = f
            .engine
            .negotiate(
                "p-2",
                "product-offering",
                &[],
                streams(vec![(peer.clone(), vec![doc])]),
            )
            .await;
        let report = second[0].result.as_ref().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.published, 0);
        assert_eq!(f.gateway.fetch_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_and_foreign_types_are_ignored() {
        let f = fixture(vec![]).await;
        let peer = PeerIdentity::new("https://node-b");

        let retired = offering("urn:PO:5", "1.0", "Retired");
        let mut category = offering("urn:C:1", "1.0", "Launched");
        category["type"] = "category".into();

        let outcomes = f
            .engine
            .negotiate(
                "p-1",
                "product-offering",
                &[],
                streams(vec![(peer, vec![retired, category])]),
            )
            .await;

        let report = outcomes[0].result.as_ref().unwrap();
        assert_eq!(report.received, 2);
        assert_eq!(report.ignored, 2);
        assert!(f.gateway.fetch_calls().is_empty());
    }
}
