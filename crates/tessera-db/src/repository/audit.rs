//! # Audit Ledger Repository
//!
//! Append-only record of every state transition an entity revision goes
//! through on this node.
//!
//! ## How The Ledger Is Read
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  audit_records (seq ascending = append order)                           │
//! │                                                                         │
//! │  seq  entity     status     source  hash  hashlink                      │
//! │  ───  ────────   ─────────  ──────  ────  ────────                      │
//! │  41   urn:PO:1   RECEIVED   LEDGER  h2    L(h1,h2)                      │
//! │  42   urn:PO:1   RETRIEVED  LEDGER  h2    L(h1,h2)                      │
//! │  43   urn:PO:1   PUBLISHED  LEDGER  h2    L(h1,h2)  ◄── checkpoint      │
//! │  44   urn:PO:7   PUBLISHED  PEER    h9    h9                            │
//! │                                                                         │
//! │  Dedup:      latest PUBLISHED of urn:PO:1 carries h2 → skip h2 again    │
//! │  Checkpoint: latest LEDGER/PUBLISHED row → created_at of seq 43         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows are never updated or deleted; triggers reject both.
//! Appends are serialized per process so the hashlink chain stays linear.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use tessera_core::integrity;
use tessera_core::{AuditRecord, AuditStatus, SyncSource};

use crate::error::{DbError, DbResult};

/// SQLite bound-parameter budget per statement.
const MAX_IN_PARAMS: usize = 500;

const SELECT_COLUMNS: &str = "id, process_id, entity_id, entity_type, content_hash, hashlink, \
                              status, source, event_id, data_location, created_at";

// =============================================================================
// AuditLedger Trait
// =============================================================================

/// The durable engine state: an append-only log of audit records.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    /// Appends a record and returns it with its hashlink filled in.
    async fn record(&self, record: AuditRecord) -> DbResult<AuditRecord>;

    /// Latest record of an entity whose status is one of `statuses`.
    /// An empty slice matches every status.
    async fn latest_by_entity(
        &self,
        entity_id: &str,
        statuses: &[AuditStatus],
    ) -> DbResult<Option<AuditRecord>>;

    /// Latest ledger-sourced PUBLISHED record: where catch-up resumes.
    async fn latest_checkpoint(&self) -> DbResult<Option<AuditRecord>>;

    /// Latest record (any status) of each given entity.
    async fn latest_for_entities(
        &self,
        entity_ids: &[String],
    ) -> DbResult<HashMap<String, AuditRecord>>;
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: String,
    process_id: String,
    entity_id: String,
    entity_type: String,
    content_hash: String,
    hashlink: Option<String>,
    status: String,
    source: String,
    event_id: Option<String>,
    data_location: Option<String>,
    created_at: String,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = DbError;

    fn try_from(row: AuditRow) -> DbResult<Self> {
        Ok(AuditRecord {
            id: Uuid::parse_str(&row.id).map_err(|e| DbError::invalid(e.to_string()))?,
            status: row.status.parse().map_err(DbError::InvalidData)?,
            source: row.source.parse().map_err(DbError::InvalidData)?,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map_err(|e| DbError::invalid(format!("created_at '{}': {}", row.created_at, e)))?
                .with_timezone(&Utc),
            process_id: row.process_id,
            entity_id: row.entity_id,
            entity_type: row.entity_type,
            content_hash: row.content_hash,
            hashlink: row.hashlink,
            event_id: row.event_id,
            data_location: row.data_location,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// =============================================================================
// Repository
// =============================================================================

/// SQLite implementation of [`AuditLedger`].
#[derive(Debug, Clone)]
pub struct AuditRepository {
    pool: SqlitePool,
    append_lock: Arc<Mutex<()>>,
}

impl AuditRepository {
    /// Creates a repository sharing the database's append lock.
    pub fn new(pool: SqlitePool, append_lock: Arc<Mutex<()>>) -> Self {
        AuditRepository { pool, append_lock }
    }

    /// All records of an entity, oldest first.
    pub async fn history(&self, entity_id: &str) -> DbResult<Vec<AuditRecord>> {
        let sql = format!(
            "SELECT {} FROM audit_records WHERE entity_id = ? ORDER BY seq ASC",
            SELECT_COLUMNS
        );
        let rows: Vec<AuditRow> = sqlx::query_as(&sql)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AuditRecord::try_from).collect()
    }

    /// Number of records with a status, optionally restricted to one source.
    pub async fn count_by_status(
        &self,
        status: AuditStatus,
        source: Option<SyncSource>,
    ) -> DbResult<i64> {
        let count: i64 = match source {
            Some(source) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM audit_records WHERE status = ? AND source = ?",
                )
                .bind(status.as_str())
                .bind(source.as_str())
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM audit_records WHERE status = ?")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

#[async_trait]
impl AuditLedger for AuditRepository {
    async fn record(&self, mut record: AuditRecord) -> DbResult<AuditRecord> {
        let _guard = self.append_lock.lock().await;

        let previous: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT content_hash, hashlink FROM audit_records
             WHERE entity_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(&record.entity_id)
        .fetch_optional(&self.pool)
        .await?;

        // The link only advances when the revision changes.
        let link = match previous {
            Some((hash, Some(link))) if hash == record.content_hash => link,
            Some((_, link)) => integrity::hashlink(link.as_deref(), &record.content_hash),
            None => integrity::hashlink(None, &record.content_hash),
        };
        record.hashlink = Some(link);
        // Stamped under the append lock so created_at follows seq order.
        // Microsecond precision matches what is stored.
        record.created_at = Utc::now().trunc_subsecs(6);

        sqlx::query(
            "INSERT INTO audit_records
                (id, process_id, entity_id, entity_type, content_hash, hashlink,
                 status, source, event_id, data_location, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.process_id)
        .bind(&record.entity_id)
        .bind(&record.entity_type)
        .bind(&record.content_hash)
        .bind(&record.hashlink)
        .bind(record.status.as_str())
        .bind(record.source.as_str())
        .bind(&record.event_id)
        .bind(&record.data_location)
        .bind(record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        debug!(
            process_id = %record.process_id,
            entity_id = %record.entity_id,
            status = %record.status,
            source = %record.source,
            "Audit record appended"
        );

        Ok(record)
    }

    async fn latest_by_entity(
        &self,
        entity_id: &str,
        statuses: &[AuditStatus],
    ) -> DbResult<Option<AuditRecord>> {
        let status_filter = if statuses.is_empty() {
            String::new()
        } else {
            format!(" AND status IN ({})", placeholders(statuses.len()))
        };
        let sql = format!(
            "SELECT {} FROM audit_records WHERE entity_id = ?{} ORDER BY seq DESC LIMIT 1",
            SELECT_COLUMNS, status_filter
        );

        let mut query = sqlx::query_as::<_, AuditRow>(&sql).bind(entity_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        query
            .fetch_optional(&self.pool)
            .await?
            .map(AuditRecord::try_from)
            .transpose()
    }

    async fn latest_checkpoint(&self) -> DbResult<Option<AuditRecord>> {
        let sql = format!(
            "SELECT {} FROM audit_records WHERE status = ? AND source = ?
             ORDER BY seq DESC LIMIT 1",
            SELECT_COLUMNS
        );

        sqlx::query_as::<_, AuditRow>(&sql)
            .bind(AuditStatus::Published.as_str())
            .bind(SyncSource::Ledger.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(AuditRecord::try_from)
            .transpose()
    }

    async fn latest_for_entities(
        &self,
        entity_ids: &[String],
    ) -> DbResult<HashMap<String, AuditRecord>> {
        let mut latest = HashMap::with_capacity(entity_ids.len());

        for chunk in entity_ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT {} FROM audit_records a
                 WHERE a.entity_id IN ({})
                   AND a.seq = (SELECT MAX(b.seq) FROM audit_records b
                                WHERE b.entity_id = a.entity_id)",
                SELECT_COLUMNS,
                placeholders(chunk.len())
            );

            let mut query = sqlx::query_as::<_, AuditRow>(&sql);
            for id in chunk {
                query = query.bind(id);
            }

            for row in query.fetch_all(&self.pool).await? {
                let record = AuditRecord::try_from(row)?;
                latest.insert(record.entity_id.clone(), record);
            }
        }

        Ok(latest)
    }
}

// =============================================================================
// Tests
// =============================================================================
