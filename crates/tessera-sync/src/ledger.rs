//! # Ledger Adapter
//!
//! Range queries over the change notifications published on the
//! distributed ledger.
//!
//! ```text
//! GET {adapter}/api/v1/events?startDate=<from ms>&endDate=<to ms>
//!   ──► [ {"id":"evt-1","entityId":"urn:PO:1","dataLocation":"…?hl=…",…}, … ]
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::error::{SyncError, SyncResult};

const EVENTS_PATH: &str = "api/v1/events";

/// Source of historical change notifications.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Raw JSON array of the notifications published in `[from_ms, to_ms]`.
    async fn range_query(&self, from_ms: i64, to_ms: i64) -> SyncResult<String>;
}

/// HTTP client for the ledger adapter's events API.
pub struct HttpLedgerAdapter {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpLedgerAdapter {
    pub fn new(base_url: &str, request_timeout: Duration) -> SyncResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpLedgerAdapter { http, base_url })
    }

    fn events_url(&self, from_ms: i64, to_ms: i64) -> SyncResult<Url> {
        let mut url = self.base_url.join(EVENTS_PATH)?;
        url.query_pairs_mut()
            .append_pair("startDate", &from_ms.to_string())
            .append_pair("endDate", &to_ms.to_string());
        Ok(url)
    }
}

#[async_trait]
impl LedgerAdapter for HttpLedgerAdapter {
    async fn range_query(&self, from_ms: i64, to_ms: i64) -> SyncResult<String> {
        let url = self.events_url(from_ms, to_ms)?;
        debug!(%url, "Querying ledger adapter");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::LedgerUnavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::LedgerUnavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(SyncError::LedgerUnavailable(format!(
                "adapter answered {}: {}",
                status, body
            )));
        }

        Ok(body)
    }
}
