//! # Ledger Catch-Up Worker
//!
//! Replays ledger change notifications the node has not applied yet.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  latest_checkpoint()                                                    │
//! │     │ none ──────────► from = 0 (epoch)                                 │
//! │     │ some(record) ──► from = record.created_at (ms)                    │
//! │     ▼                                                                   │
//! │  range_query(from, now) ──► deserialize ──(error: abort, checkpoint     │
//! │                                  │          untouched)                  │
//! │                                  ▼                                      │
//! │                 batches of 50, one after another                        │
//! │                 ┌────────────────────────────────────────┐              │
//! │                 │ entities of a batch concurrently,      │              │
//! │                 │ one entity's items in ledger order:    │              │
//! │                 │  RECEIVED                              │              │
//! │                 │  already PUBLISHED with same hash? skip│              │
//! │                 │  retrieve(dataLocation)                │              │
//! │                 │  verify hash ──mismatch──► abandon     │              │
//! │                 │  RETRIEVED ─► publish ─► PUBLISHED     │              │
//! │                 └────────────────────────────────────────┘              │
//! │                                                                         │
//! │  Every PUBLISHED(LEDGER) record is a new checkpoint.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use tessera_core::{integrity, AuditRecord, AuditStatus, ChangeNotification, RawEntity};
use tessera_db::{AuditLedger, EntityStore};

use crate::error::{SyncError, SyncResult};
use crate::ledger::LedgerAdapter;
use crate::retriever::EntityRetriever;

/// Notifications per batch when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Counters for one catch-up cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchupReport {
    /// Start of the queried range (unix ms).
    pub from_ms: i64,
    /// End of the queried range (unix ms).
    pub to_ms: i64,
    /// True when the range started at a prior checkpoint.
    pub resumed: bool,
    pub received: usize,
    pub published: usize,
    /// Notifications whose revision was already published.
    pub skipped: usize,
    pub failed: usize,
    /// Size of each processed batch, in order.
    pub batch_sizes: Vec<usize>,
}

enum ItemOutcome {
    Published,
    Skipped,
}

/// Pulls change notifications from the ledger and applies them.
pub struct LedgerCatchupWorker {
    adapter: Arc<dyn LedgerAdapter>,
    retriever: Arc<dyn EntityRetriever>,
    audit: Arc<dyn AuditLedger>,
    store: Arc<dyn EntityStore>,
    batch_size: usize,
    item_concurrency: usize,
}

impl LedgerCatchupWorker {
    pub fn new(
        adapter: Arc<dyn LedgerAdapter>,
        retriever: Arc<dyn EntityRetriever>,
        audit: Arc<dyn AuditLedger>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        LedgerCatchupWorker {
            adapter,
            retriever,
            audit,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            item_concurrency: 8,
        }
    }

    /// Sets the batch size (minimum 1).
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets how many items of a batch run at once (minimum 1).
    pub fn item_concurrency(mut self, limit: usize) -> Self {
        self.item_concurrency = limit.max(1);
        self
    }

    /// Runs one catch-up cycle.
    ///
    /// ## Errors
    /// Fails only when the ledger cannot be queried or its answer cannot
    /// be decoded; in both cases nothing is written. Item failures are
    /// counted in the report.
    pub async fn run_cycle(&self, process_id: &str) -> SyncResult<CatchupReport> {
        let checkpoint = self.audit.latest_checkpoint().await?;
        let (from_ms, resumed) = match &checkpoint {
            Some(record) => (record.created_at.timestamp_millis(), true),
            None => (0, false),
        };
        let to_ms = Utc::now().timestamp_millis();

        info!(process_id, from_ms, to_ms, resumed, "Starting ledger catch-up");

        let raw = self.adapter.range_query(from_ms, to_ms).await?;
        let notifications: Vec<ChangeNotification> = serde_json::from_str(&raw)
            .map_err(|e| SyncError::DeserializationFailed(e.to_string()))?;

        let mut report = CatchupReport {
            from_ms,
            to_ms,
            resumed,
            received: notifications.len(),
            ..CatchupReport::default()
        };

        for (index, batch) in notifications.chunks(self.batch_size).enumerate() {
            report.batch_sizes.push(batch.len());
            debug!(process_id, batch = index, size = batch.len(), "Processing batch");

            let outcomes: Vec<Vec<SyncResult<ItemOutcome>>> =
                stream::iter(group_by_entity(batch))
                    .map(|group| async move {
                        let mut outcomes = Vec::with_capacity(group.len());
                        for notification in &group {
                            outcomes.push(self.process_logged(process_id, notification).await);
                        }
                        outcomes
                    })
                    .buffer_unordered(self.item_concurrency)
                    .collect()
                    .await;

            for outcome in outcomes.into_iter().flatten() {
                match outcome {
                    Ok(ItemOutcome::Published) => report.published += 1,
                    Ok(ItemOutcome::Skipped) => report.skipped += 1,
                    Err(_) => report.failed += 1,
                }
            }
        }

        info!(
            process_id,
            received = report.received,
            published = report.published,
            skipped = report.skipped,
            failed = report.failed,
            "Ledger catch-up finished"
        );
        Ok(report)
    }

    async fn process_logged(
        &self,
        process_id: &str,
        notification: &ChangeNotification,
    ) -> SyncResult<ItemOutcome> {
        let result = self.process(process_id, notification).await;
        if let Err(e) = &result {
            if e.is_integrity_error() {
                warn!(
                    process_id,
                    entity_id = %notification.entity_id,
                    event_id = %notification.event_id,
                    error = %e,
                    "Integrity check failed, notification abandoned"
                );
            } else {
                warn!(
                    process_id,
                    entity_id = %notification.entity_id,
                    event_id = %notification.event_id,
                    error = %e,
                    "Notification could not be applied"
                );
            }
        }
        result
    }

    async fn process(
        &self,
        process_id: &str,
        notification: &ChangeNotification,
    ) -> SyncResult<ItemOutcome> {
        self.audit
            .record(AuditRecord::from_notification(
                process_id,
                notification,
                AuditStatus::Received,
            ))
            .await?;

        let claimed = notification.claimed_hash().ok_or_else(|| {
            SyncError::InvalidEntity(format!(
                "notification {} announces no content hash",
                notification.event_id
            ))
        })?;

        if let Some(latest) = self
            .audit
            .latest_by_entity(&notification.entity_id, &[AuditStatus::Published])
            .await?
        {
            if latest.content_hash.eq_ignore_ascii_case(&claimed) {
                debug!(process_id, entity_id = %notification.entity_id, "Already published, skipping");
                return Ok(ItemOutcome::Skipped);
            }
        }

        let document = self
            .retriever
            .retrieve_by_notification(process_id, notification)
            .await?;

        integrity::verify(&notification.entity_id, &claimed, &document)?;

        let entity = RawEntity::from_json(document)?;
        if entity.id != notification.entity_id {
            return Err(SyncError::InvalidEntity(format!(
                "notification {} is for {} but the document is {}",
                notification.event_id, notification.entity_id, entity.id
            )));
        }

        self.audit
            .record(applied_record(process_id, notification, &entity, AuditStatus::Retrieved))
            .await?;

        self.store.publish(&entity).await?;

        self.audit
            .record(applied_record(process_id, notification, &entity, AuditStatus::Published))
            .await?;

        Ok(ItemOutcome::Published)
    }
}

/// Splits a batch into per-entity groups, keeping ledger order inside each
/// group and first-appearance order between groups.
fn group_by_entity(batch: &[ChangeNotification]) -> Vec<Vec<ChangeNotification>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<ChangeNotification>> = Vec::new();
    for notification in batch {
        match index.get(notification.entity_id.as_str()) {
            Some(&slot) => groups[slot].push(notification.clone()),
            None => {
                index.insert(notification.entity_id.as_str(), groups.len());
                groups.push(vec![notification.clone()]);
            }
        }
    }
    groups
}

/// Ledger record whose type comes from the retrieved document.
fn applied_record(
    process_id: &str,
    notification: &ChangeNotification,
    entity: &RawEntity,
    status: AuditStatus,
) -> AuditRecord {
    let mut record = AuditRecord::from_notification(process_id, notification, status);
    record.entity_type = entity.entity_type.clone();
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::offering;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tessera_core::SyncSource;
    use tessera_db::{Database, DbConfig, MemoryEntityStore};

    /// Ledger returning a fixed body and remembering every range.
    struct FakeLedger {
        body: Mutex<String>,
        calls: Mutex<Vec<(i64, i64)>>,
    }

    impl FakeLedger {
        fn new(body: String) -> Self {
            FakeLedger {
                body: Mutex::new(body),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(i64, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LedgerAdapter for FakeLedger {
        async fn range_query(&self, from_ms: i64, to_ms: i64) -> SyncResult<String> {
            self.calls.lock().unwrap().push((from_ms, to_ms));
            Ok(self.body.lock().unwrap().clone())
        }
    }

    /// Origin serving documents by entity id.
    #[derive(Default)]
    struct FakeOrigin {
        documents: HashMap<String, Value>,
    }

    #[async_trait]
    impl EntityRetriever for FakeOrigin {
        async fn retrieve_by_notification(
            &self,
            _process_id: &str,
            notification: &ChangeNotification,
        ) -> SyncResult<Value> {
            self.documents
                .get(&notification.entity_id)
                .cloned()
                .ok_or_else(|| SyncError::RetrievalFailed {
                    entity_id: notification.entity_id.clone(),
                    reason: "404".into(),
                })
        }
    }

    struct Scenario {
        notifications: Vec<Value>,
        origin: FakeOrigin,
    }

    /// `count` offerings announced on the ledger; ids in `tampered` are
    /// served with a body that does not match the announced hash.
    fn scenario(count: usize, tampered: &[usize]) -> Scenario {
        let mut notifications = Vec::with_capacity(count);
        let mut origin = FakeOrigin::default();

        for i in 0..count {
            let id = format!("urn:PO:{}", i);
            let document = offering(&id, "1.0", "Launched");
            let hash = integrity::content_hash(&document);

            notifications.push(json!({
                "id": format!("evt-{}", i),
                "entityId": id,
                "entityType": "product-offering",
                "dataLocation": format!("http://origin/ngsi-ld/v1/entities/{}?hl={}", id, hash),
                "timestamp": 1_700_000_000_000_i64 + i as i64,
            }));

            let served = if tampered.contains(&i) {
                offering(&id, "6.6.6", "Launched")
            } else {
                document
            };
            origin.documents.insert(id, served);
        }

        Scenario {
            notifications,
            origin,
        }
    }

    /// Origin serving one document per event, each after its own delay.
    #[derive(Default)]
    struct EventOrigin {
        documents: HashMap<String, (Value, Duration)>,
    }

    #[async_trait]
    impl EntityRetriever for EventOrigin {
        async fn retrieve_by_notification(
            &self,
            _process_id: &str,
            notification: &ChangeNotification,
        ) -> SyncResult<Value> {
            let (document, delay) = self
                .documents
                .get(&notification.event_id)
                .cloned()
                .ok_or_else(|| SyncError::RetrievalFailed {
                    entity_id: notification.entity_id.clone(),
                    reason: "404".into(),
                })?;
            tokio::time::sleep(delay).await;
            Ok(document)
        }
    }

    async fn worker(
        body: String,
        origin: impl EntityRetriever + 'static,
    ) -> (LedgerCatchupWorker, Arc<FakeLedger>, Arc<MemoryEntityStore>, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let ledger = Arc::new(FakeLedger::new(body));
        let store = Arc::new(MemoryEntityStore::new());
        let worker = LedgerCatchupWorker::new(
            ledger.clone(),
            Arc::new(origin),
            Arc::new(db.audit()),
            store.clone(),
        );
        (worker, ledger, store, db)
    }

    #[tokio::test]
    async fn test_batches_and_isolated_integrity_failure() {
        let s = scenario(120, &[37]);
        let body = Value::Array(s.notifications).to_string();
        let (worker, _ledger, store, db) = worker(body, s.origin).await;

        let report = worker.run_cycle("p-1").await.unwrap();

        assert_eq!(report.batch_sizes, vec![50, 50, 20]);
        assert_eq!(report.received, 120);
        assert_eq!(report.published, 119);
        assert_eq!(report.failed, 1);
        assert_eq!(store.len().await, 119);
        assert!(store.get("urn:PO:37").await.is_none());

        let published = db
            .audit()
            .count_by_status(AuditStatus::Published, Some(SyncSource::Ledger))
            .await
            .unwrap();
        assert_eq!(published, 119);

        // The tampered item stopped after RECEIVED.
        let history = db.audit().history("urn:PO:37").await.unwrap();
        let statuses: Vec<AuditStatus> = history.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![AuditStatus::Received]);
    }

    #[tokio::test]
    async fn test_first_cycle_from_epoch_then_from_checkpoint() {
        let s = scenario(3, &[]);
        let body = Value::Array(s.notifications).to_string();
        let (worker, ledger, _store, db) = worker(body, s.origin).await;

        let first = worker.run_cycle("p-1").await.unwrap();
        assert_eq!(first.from_ms, 0);
        assert!(!first.resumed);

        let checkpoint = db.audit().latest_checkpoint().await.unwrap().unwrap();

        let second = worker.run_cycle("p-2").await.unwrap();
        assert!(second.resumed);
        assert_eq!(second.from_ms, checkpoint.created_at.timestamp_millis());

        let calls = ledger.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, 0);
        assert_eq!(calls[1].0, checkpoint.created_at.timestamp_millis());
        assert!(calls[1].1 >= calls[1].0);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let s = scenario(3, &[]);
        let body = Value::Array(s.notifications).to_string();
        let (worker, _ledger, store, db) = worker(body, s.origin).await;

        let first = worker.run_cycle("p-1").await.unwrap();
        assert_eq!(first.published, 3);

        let second = worker.run_cycle("p-2").await.unwrap();
        assert_eq!(second.published, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(store.len().await, 3);

        // Every delivery is logged on intake; only the first one published.
        let audit = db.audit();
        assert_eq!(
            audit
                .count_by_status(AuditStatus::Published, None)
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            audit
                .count_by_status(AuditStatus::Received, None)
                .await
                .unwrap(),
            6
        );
    }

    #[tokio::test]
    async fn test_same_entity_applied_in_ledger_order() {
        let v1 = offering("urn:PO:1", "1.0", "Launched");
        let v2 = offering("urn:PO:1", "2.0", "Launched");
        let announce = |event: &str, document: &Value, ts: i64| {
            json!({
                "id": event,
                "entityId": "urn:PO:1",
                "entityType": "product-offering",
                "contentHash": integrity::content_hash(document),
                "dataLocation": "http://origin/ngsi-ld/v1/entities/urn:PO:1",
                "timestamp": ts,
            })
        };
        let body = json!([
            announce("evt-1", &v1, 1_700_000_000_000),
            announce("evt-2", &v2, 1_700_000_000_001),
        ])
        .to_string();

        // The older revision is the slower one to retrieve.
        let mut origin = EventOrigin::default();
        origin
            .documents
            .insert("evt-1".into(), (v1, Duration::from_millis(100)));
        origin
            .documents
            .insert("evt-2".into(), (v2.clone(), Duration::ZERO));

        let (worker, _ledger, store, db) = worker(body, origin).await;
        let report = worker.run_cycle("p-1").await.unwrap();
        assert_eq!(report.published, 2);

        let stored = store.get("urn:PO:1").await.unwrap();
        assert_eq!(stored.version, "2.0");

        let history = db.audit().history("urn:PO:1").await.unwrap();
        let steps: Vec<(AuditStatus, &str)> = history
            .iter()
            .map(|r| (r.status, r.event_id.as_deref().unwrap_or("")))
            .collect();
        assert_eq!(
            steps,
            vec![
                (AuditStatus::Received, "evt-1"),
                (AuditStatus::Retrieved, "evt-1"),
                (AuditStatus::Published, "evt-1"),
                (AuditStatus::Received, "evt-2"),
                (AuditStatus::Retrieved, "evt-2"),
                (AuditStatus::Published, "evt-2"),
            ]
        );

        let latest = db
            .audit()
            .latest_by_entity("urn:PO:1", &[AuditStatus::Published])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.content_hash, integrity::content_hash(&v2));
    }

    #[tokio::test]
    async fn test_undecodable_ledger_answer_keeps_checkpoint() {
        let s = scenario(2, &[]);
        let body = Value::Array(s.notifications).to_string();
        let (worker, ledger, _store, db) = worker(body, s.origin).await;

        worker.run_cycle("p-1").await.unwrap();
        let before = db.audit().latest_checkpoint().await.unwrap();

        *ledger.body.lock().unwrap() = "{not a list".to_string();
        let err = worker.run_cycle("p-2").await.unwrap_err();
        assert!(matches!(err, SyncError::DeserializationFailed(_)));

        let after = db.audit().latest_checkpoint().await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_missing_document_fails_only_that_item() {
        let mut s = scenario(3, &[]);
        s.origin.documents.remove("urn:PO:1");
        let body = Value::Array(s.notifications).to_string();
        let (worker, _ledger, store, _db) = worker(body, s.origin).await;

        let report = worker.run_cycle("p-1").await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);
        assert!(store.get("urn:PO:1").await.is_none());
    }
}
