//! # Origin Retriever
//!
//! Fetches the entity document a change notification points at.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use tessera_core::ChangeNotification;

use crate::error::{SyncError, SyncResult};

/// Resolves a notification's data location to the entity document.
#[async_trait]
pub trait EntityRetriever: Send + Sync {
    async fn retrieve_by_notification(
        &self,
        process_id: &str,
        notification: &ChangeNotification,
    ) -> SyncResult<Value>;
}

/// GETs the data location over HTTP, without its `hl` parameter.
pub struct HttpEntityRetriever {
    http: reqwest::Client,
}

impl HttpEntityRetriever {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpEntityRetriever { http })
    }
}

#[async_trait]
impl EntityRetriever for HttpEntityRetriever {
    async fn retrieve_by_notification(
        &self,
        process_id: &str,
        notification: &ChangeNotification,
    ) -> SyncResult<Value> {
        let url = notification.retrieval_url();
        debug!(process_id, entity_id = %notification.entity_id, url, "Retrieving entity");

        let failed = |reason: String| SyncError::RetrievalFailed {
            entity_id: notification.entity_id.clone(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("origin answered {}", status)));
        }

        response.json::<Value>().await.map_err(|e| failed(e.to_string()))
    }
}
