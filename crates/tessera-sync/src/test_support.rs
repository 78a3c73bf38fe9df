//! Fakes and fixtures shared by the sync unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};

use tessera_core::{EntitySummary, PeerIdentity, RawEntity};

use crate::client::{PeerGateway, SummaryStream};
use crate::error::NegotiationFailure;

/// NGSI-LD product offering document.
pub fn offering(id: &str, version: &str, status: &str) -> Value {
    json!({
        "id": id,
        "type": "product-offering",
        "version": {"type": "Property", "value": version},
        "lifecycleStatus": {"type": "Property", "value": status},
        "validFor": {
            "type": "Property",
            "value": {"startDateTime": "2020-01-01T00:00:00Z"}
        }
    })
}

pub fn summary_of(document: &Value) -> EntitySummary {
    RawEntity::from_json(document.clone()).unwrap().summarize(None)
}

/// In-memory [`PeerGateway`] with canned answers per peer.
#[derive(Default)]
pub struct FakeGateway {
    summaries: Mutex<HashMap<PeerIdentity, Result<Vec<EntitySummary>, NegotiationFailure>>>,
    documents: Mutex<HashMap<PeerIdentity, Vec<Value>>>,
    fetch_calls: Mutex<Vec<(PeerIdentity, Vec<String>)>>,
    exchanges: Mutex<Vec<(PeerIdentity, usize)>>,
    exchange_delay: Mutex<Duration>,
}

impl FakeGateway {
    /// Serves `documents` from `peer`, advertising their summaries.
    pub fn serve(&self, peer: &PeerIdentity, documents: Vec<Value>) {
        let summaries = documents.iter().map(summary_of).collect();
        self.summaries
            .lock()
            .unwrap()
            .insert(peer.clone(), Ok(summaries));
        self.documents.lock().unwrap().insert(peer.clone(), documents);
    }

    /// Makes the discovery call to `peer` fail.
    pub fn fail(&self, peer: &PeerIdentity, failure: NegotiationFailure) {
        self.summaries
            .lock()
            .unwrap()
            .insert(peer.clone(), Err(failure));
    }

    /// Replaces what `peer` returns from the entities endpoint.
    pub fn override_documents(&self, peer: &PeerIdentity, documents: Vec<Value>) {
        self.documents.lock().unwrap().insert(peer.clone(), documents);
    }

    /// Makes every discovery call take at least `delay`.
    pub fn delay_exchanges(&self, delay: Duration) {
        *self.exchange_delay.lock().unwrap() = delay;
    }

    pub fn fetch_calls(&self) -> Vec<(PeerIdentity, Vec<String>)> {
        self.fetch_calls.lock().unwrap().clone()
    }

    /// `(peer, number of summaries sent)` per discovery call.
    pub fn exchanges(&self) -> Vec<(PeerIdentity, usize)> {
        self.exchanges.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerGateway for FakeGateway {
    async fn exchange(
        &self,
        _process_id: &str,
        peer: &PeerIdentity,
        _local_domain: &str,
        outgoing: std::sync::Arc<[EntitySummary]>,
    ) -> Result<SummaryStream, NegotiationFailure> {
        self.exchanges
            .lock()
            .unwrap()
            .push((peer.clone(), outgoing.len()));

        let delay = *self.exchange_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let answer = self
            .summaries
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()));

        answer.map(|summaries| stream::iter(summaries.into_iter().map(Ok)).boxed())
    }

    async fn fetch_entities(
        &self,
        _process_id: &str,
        peer: &PeerIdentity,
        ids: &[String],
    ) -> Result<Vec<Value>, NegotiationFailure> {
        self.fetch_calls
            .lock()
            .unwrap()
            .push((peer.clone(), ids.to_vec()));

        let documents = self
            .documents
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default();

        Ok(documents
            .into_iter()
            .filter(|doc| {
                doc.get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| ids.iter().any(|wanted| wanted == id))
            })
            .collect())
    }
}
