//! # Domain Types
//!
//! Types shared by every layer of the sync engine.
//!
//! ## Type Relationships
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Domain Model                                │
//! │                                                                         │
//! │  RawEntity (stored document)                                            │
//! │       │ summarize(hashlink)                                             │
//! │       ▼                                                                 │
//! │  EntitySummary ──► ReplicationEligibility ──► policy filter             │
//! │       │                                                                 │
//! │       │ exchanged with peers as NDJSON                                  │
//! │       ▼                                                                 │
//! │  NegotiationResult { create, update, ignored }                          │
//! │                                                                         │
//! │  ChangeNotification (ledger) ──► AuditRecord* ──► store                 │
//! │                                  RECEIVED → RETRIEVED → PUBLISHED       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Summaries and negotiation results live for a single cycle. Audit
//! records are the only durable engine state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::integrity;

// =============================================================================
// Entity Summary
// =============================================================================

/// Lightweight descriptor of one entity, exchanged during negotiation.
///
/// ## Wire Format (one NDJSON line)
/// ```json
/// {"id":"urn:PO:1","type":"product-offering","version":"1.2",
///  "lastUpdate":"2024-04-01T10:00:00Z","lifecycleStatus":"Launched",
///  "validFrom":"2024-01-01T00:00:00Z","validTo":null,
///  "contentHash":"9f86…","hashlink":"1b4f…"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub id: String,

    #[serde(rename = "type")]
    pub entity_type: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub last_update: Option<String>,

    #[serde(default)]
    pub lifecycle_status: Option<String>,

    #[serde(default)]
    pub valid_from: Option<String>,

    #[serde(default)]
    pub valid_to: Option<String>,

    pub content_hash: String,

    #[serde(default)]
    pub hashlink: Option<String>,
}

impl EntitySummary {
    /// Projects the attributes the replication policy looks at.
    pub fn eligibility(&self) -> ReplicationEligibility {
        ReplicationEligibility {
            id: self.id.clone(),
            lifecycle_status: self.lifecycle_status.clone(),
            valid_from: self.valid_from.clone(),
            valid_to: self.valid_to.clone(),
        }
    }
}

/// Input of the replication policy filter.
///
/// Dates stay raw so an unreadable bound can be rejected instead of ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEligibility {
    pub id: String,
    pub lifecycle_status: Option<String>,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
}

// =============================================================================
// Raw Entity
// =============================================================================

/// An entity document as held by the local store or served by a peer.
///
/// Attributes are read either NGSI-LD style (`{"type":"Property","value":…}`)
/// or as plain values. The validity window lives under
/// `validFor.{startDateTime,endDateTime}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntity {
    pub id: String,
    pub entity_type: String,
    pub version: String,
    pub last_update: Option<String>,
    pub lifecycle_status: Option<String>,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
    pub body: Value,
}

impl RawEntity {
    /// Parses a JSON document into a RawEntity.
    ///
    /// ## Errors
    /// `CoreError::MalformedEntity` if the document is not an object or
    /// lacks a string `id` / `type`.
    pub fn from_json(body: Value) -> CoreResult<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| CoreError::malformed("entity is not a JSON object"))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::malformed("entity has no string 'id'"))?
            .to_string();

        let entity_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::malformed(format!("entity {} has no string 'type'", id)))?
            .to_string();

        let valid_for = attribute(&body, "validFor");

        Ok(RawEntity {
            entity_type,
            version: attribute(&body, "version")
                .and_then(scalar_string)
                .unwrap_or_default(),
            last_update: attribute(&body, "lastUpdate").and_then(scalar_string),
            lifecycle_status: attribute(&body, "lifecycleStatus").and_then(scalar_string),
            valid_from: valid_for
                .and_then(|v| v.get("startDateTime"))
                .and_then(scalar_string),
            valid_to: valid_for
                .and_then(|v| v.get("endDateTime"))
                .and_then(scalar_string),
            id,
            body,
        })
    }

    /// Builds the summary advertised to peers.
    ///
    /// The content hash is always recomputed from the body; the hashlink is
    /// the latest audit hashlink for the entity, if any.
    pub fn summarize(&self, hashlink: Option<String>) -> EntitySummary {
        let content_hash = integrity::content_hash(&self.body);
        EntitySummary {
            id: self.id.clone(),
            entity_type: self.entity_type.clone(),
            version: self.version.clone(),
            last_update: self.last_update.clone(),
            lifecycle_status: self.lifecycle_status.clone(),
            valid_from: self.valid_from.clone(),
            valid_to: self.valid_to.clone(),
            hashlink: Some(hashlink.unwrap_or_else(|| content_hash.clone())),
            content_hash,
        }
    }

    /// Projects the attributes the replication policy looks at.
    pub fn eligibility(&self) -> ReplicationEligibility {
        ReplicationEligibility {
            id: self.id.clone(),
            lifecycle_status: self.lifecycle_status.clone(),
            valid_from: self.valid_from.clone(),
            valid_to: self.valid_to.clone(),
        }
    }
}

/// Returns the value of an attribute, unwrapping NGSI-LD `{"value": …}`.
fn attribute<'a>(body: &'a Value, name: &str) -> Option<&'a Value> {
    let raw = body.get(name)?;
    match raw {
        Value::Object(map) if map.contains_key("value") => map.get("value"),
        other => Some(other),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// Peer Identity
// =============================================================================

/// A remote node, identified by its base URL.
///
/// Trailing slashes are dropped so `http://a/` and `http://a` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity {
    endpoint_url: String,
}

impl PeerIdentity {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        let url: String = endpoint_url.into();
        PeerIdentity {
            endpoint_url: url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Joins a protocol path onto the peer's base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint_url, path.trim_start_matches('/'))
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.endpoint_url)
    }
}

// =============================================================================
// Change Notification
// =============================================================================

/// A change event published on the distributed ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    #[serde(alias = "id")]
    pub event_id: String,

    pub entity_id: String,

    #[serde(default)]
    pub entity_type: Option<String>,

    /// Announced hash of the entity body. Falls back to the `hl` query
    /// parameter of `data_location` when absent.
    #[serde(default)]
    pub content_hash: Option<String>,

    pub data_location: String,

    /// Event time in unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl ChangeNotification {
    /// Returns the hash the ledger claims for the entity, if any.
    pub fn claimed_hash(&self) -> Option<String> {
        if let Some(hash) = self.content_hash.as_ref().filter(|h| !h.is_empty()) {
            return Some(hash.clone());
        }
        let query = self.data_location.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "hl")
            .map(|(_, value)| value.to_string())
            .filter(|value| !value.is_empty())
    }

    /// Returns the data location without its hash query parameter.
    pub fn retrieval_url(&self) -> &str {
        match self.data_location.split_once("?hl=") {
            Some((base, _)) => base,
            None => &self.data_location,
        }
    }
}

// =============================================================================
// Audit Record
// =============================================================================

/// Lifecycle state of one entity revision.
///
/// ```text
/// RECEIVED ──► RETRIEVED ──► PUBLISHED
///                 (integrity failure stops before RETRIEVED)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Received,
    Retrieved,
    Published,
    Deleted,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Received => "RECEIVED",
            AuditStatus::Retrieved => "RETRIEVED",
            AuditStatus::Published => "PUBLISHED",
            AuditStatus::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RECEIVED" => Ok(AuditStatus::Received),
            "RETRIEVED" => Ok(AuditStatus::Retrieved),
            "PUBLISHED" => Ok(AuditStatus::Published),
            "DELETED" => Ok(AuditStatus::Deleted),
            _ => Err(format!("Unknown audit status: {}", s)),
        }
    }
}

/// Which channel produced an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncSource {
    /// Change notification pulled from the distributed ledger.
    Ledger,
    /// Entity discovered through peer negotiation.
    Peer,
}

impl SyncSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSource::Ledger => "LEDGER",
            SyncSource::Peer => "PEER",
        }
    }
}

impl std::fmt::Display for SyncSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LEDGER" => Ok(SyncSource::Ledger),
            "PEER" => Ok(SyncSource::Peer),
            _ => Err(format!("Unknown sync source: {}", s)),
        }
    }
}

/// One append-only entry of the audit ledger.
///
/// `hashlink` and `created_at` are set by the ledger on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub process_id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub content_hash: String,
    pub hashlink: Option<String>,
    pub status: AuditStatus,
    pub source: SyncSource,
    pub event_id: Option<String>,
    pub data_location: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a record with a fresh id.
    pub fn new(
        process_id: impl Into<String>,
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        content_hash: impl Into<String>,
        status: AuditStatus,
        source: SyncSource,
    ) -> Self {
        AuditRecord {
            id: Uuid::new_v4(),
            process_id: process_id.into(),
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            content_hash: content_hash.into(),
            hashlink: None,
            status,
            source,
            event_id: None,
            data_location: None,
            created_at: Utc::now(),
        }
    }

    /// Builds a ledger-sourced record for a change notification.
    pub fn from_notification(
        process_id: &str,
        notification: &ChangeNotification,
        status: AuditStatus,
    ) -> Self {
        let mut record = AuditRecord::new(
            process_id,
            notification.entity_id.clone(),
            notification.entity_type.clone().unwrap_or_default(),
            notification.claimed_hash().unwrap_or_default(),
            status,
            SyncSource::Ledger,
        );
        record.event_id = Some(notification.event_id.clone());
        record.data_location = Some(notification.data_location.clone());
        record
    }
}

// =============================================================================
// Negotiation Result
// =============================================================================

/// Outcome of reconciling local summaries with one peer's summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationResult {
    /// Remote entities absent locally.
    pub create: Vec<EntitySummary>,
    /// Remote entities newer than the local copy.
    pub update: Vec<EntitySummary>,
    /// Ids left untouched (not newer, wrong type or not eligible).
    pub ignored: Vec<String>,
}

impl NegotiationResult {
    /// Every summary that must be fetched from the peer.
    pub fn to_fetch(&self) -> impl Iterator<Item = &EntitySummary> {
        self.create.iter().chain(self.update.iter())
    }

    pub fn fetch_count(&self) -> usize {
        self.create.len() + self.update.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetch_count() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
