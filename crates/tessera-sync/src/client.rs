//! # Peer Negotiation Client
//!
//! Outbound side of the peer protocol.
//!
//! ## Request Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         One Peer Call                                   │
//! │                                                                         │
//! │  mint token (htu = full URL)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  POST ──► transport error? ──yes──► retries left? ──yes──► sleep 1 s ─┐ │
//! │   ▲          │                            │ no                        │ │
//! │   │          │ no                         ▼                           │ │
//! │   │          ▼                        Transport                       │ │
//! │   │     2xx? ──yes──► read body ── transport error? ──yes─────────────┤ │
//! │   │          │ no          │ no                                       │ │
//! │   │          ▼             ▼                                          │ │
//! │   │     4xx ► ClientError   5xx ► ServerError   other ► Unexpected    │ │
//! │   │     (terminal, never retried)                                     │ │
//! │   └───────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A connection lost while the response body is read restarts the whole
//! call from the same retry budget. Discovery responses are decoded line
//! by line and handed out once the body is complete, so a restart never
//! yields a summary twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, warn};

use tessera_core::{EntitySummary, PeerIdentity};

use crate::config::NodeConfig;
use crate::error::{NegotiationFailure, SyncError, SyncResult};
use crate::protocol::{
    decode_ndjson, ndjson_stream, NdjsonError, DISCOVERY_PATH, ENTITIES_PATH, ISSUER_HEADER,
    NDJSON_CONTENT_TYPE,
};
use crate::token::TokenService;

/// Summaries received from one peer.
pub type SummaryStream = BoxStream<'static, Result<EntitySummary, NegotiationFailure>>;

// =============================================================================
// PeerGateway Trait
// =============================================================================

/// Talks to remote nodes.
#[async_trait]
pub trait PeerGateway: Send + Sync {
    /// Sends the local summaries of one type and returns the peer's
    /// summaries as a stream.
    async fn exchange(
        &self,
        process_id: &str,
        peer: &PeerIdentity,
        local_domain: &str,
        outgoing: Arc<[EntitySummary]>,
    ) -> Result<SummaryStream, NegotiationFailure>;

    /// Fetches full entity documents by id.
    async fn fetch_entities(
        &self,
        process_id: &str,
        peer: &PeerIdentity,
        ids: &[String],
    ) -> Result<Vec<Value>, NegotiationFailure>;
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Fixed-delay, bounded retry for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy { max_retries, delay }
    }

    /// Starts a fresh retry budget for one call.
    pub fn backoff(&self) -> FixedRetry {
        FixedRetry {
            delay: self.delay,
            max_retries: self.max_retries,
            used: 0,
        }
    }
}

/// [`Backoff`] yielding the same delay a bounded number of times.
#[derive(Debug, Clone)]
pub struct FixedRetry {
    delay: Duration,
    max_retries: u32,
    used: u32,
}

impl Backoff for FixedRetry {
    fn reset(&mut self) {
        self.used = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.used >= self.max_retries {
            return None;
        }
        self.used += 1;
        Some(self.delay)
    }
}

// =============================================================================
// HTTP Client
// =============================================================================

/// reqwest-based [`PeerGateway`].
pub struct HttpPeerClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenService>,
    issuer: String,
    retry: RetryPolicy,
}

impl HttpPeerClient {
    /// Creates a client.
    ///
    /// `issuer` is this node's domain id, sent with entity fetches.
    pub fn new(
        tokens: Arc<dyn TokenService>,
        issuer: impl Into<String>,
        retry: RetryPolicy,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpPeerClient {
            http,
            tokens,
            issuer: issuer.into(),
            retry,
        })
    }

    /// Creates a client from the `[node]` and `[retry]` sections.
    pub fn from_config(config: &NodeConfig, tokens: Arc<dyn TokenService>) -> SyncResult<Self> {
        Self::new(
            tokens,
            config.node.domain.clone(),
            RetryPolicy::new(config.retry.max_retries, config.retry.delay()),
            config.retry.request_timeout(),
            config.retry.connect_timeout(),
        )
    }

    /// Sends a POST built by `build` and reads the answer with `read`.
    ///
    /// Transport failures are retried, whether they happen while sending
    /// or while `read` consumes the body. Everything else is terminal.
    async fn call_with_retry<T, B, R, Fut>(
        &self,
        process_id: &str,
        peer: &PeerIdentity,
        path: &str,
        issuer: &str,
        build: B,
        read: R,
    ) -> Result<T, NegotiationFailure>
    where
        B: Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
        R: Fn(reqwest::Response) -> Fut,
        Fut: Future<Output = Result<T, NegotiationFailure>>,
    {
        let url = peer.endpoint(path);
        let mut backoff = self.retry.backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let token = self
                .tokens
                .mint_token(&url)
                .map_err(|e| NegotiationFailure::Token {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                })?;

            let request = build(self.http.post(&url))
                .bearer_auth(token)
                .header(ISSUER_HEADER, issuer);

            debug!(process_id, peer = %peer, path, attempt, "Sending peer request");

            let outcome = match request.send().await {
                Ok(response) => match classify(peer, response).await {
                    Ok(response) => read(response).await,
                    Err(failure) => Err(failure),
                },
                Err(e) => Err(transport(peer, e)),
            };

            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(failure) if failure.is_retryable() => failure,
                Err(failure) => return Err(failure),
            };

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        process_id,
                        peer = %peer,
                        attempt,
                        error = %failure,
                        "Peer request failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(process_id, peer = %peer, attempt, "Peer unreachable, giving up");
                    return Err(failure);
                }
            }
        }
    }
}

fn transport(peer: &PeerIdentity, error: impl std::fmt::Display) -> NegotiationFailure {
    NegotiationFailure::Transport {
        peer: peer.to_string(),
        reason: error.to_string(),
    }
}

fn malformed(peer: &PeerIdentity, error: impl std::fmt::Display) -> NegotiationFailure {
    NegotiationFailure::MalformedResponse {
        peer: peer.to_string(),
        reason: error.to_string(),
    }
}

/// Passes 2xx through; reads the body of anything else into a failure.
async fn classify(
    peer: &PeerIdentity,
    response: reqwest::Response,
) -> Result<reqwest::Response, NegotiationFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(NegotiationFailure::from_status(
        peer.to_string(),
        status.as_u16(),
        body,
    ))
}

#[async_trait]
impl PeerGateway for HttpPeerClient {
    async fn exchange(
        &self,
        process_id: &str,
        peer: &PeerIdentity,
        local_domain: &str,
        outgoing: Arc<[EntitySummary]>,
    ) -> Result<SummaryStream, NegotiationFailure> {
        let count = outgoing.len();
        let summaries = self
            .call_with_retry(
                process_id,
                peer,
                DISCOVERY_PATH,
                local_domain,
                |request| {
                    request
                        .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
                        .header(ACCEPT, NDJSON_CONTENT_TYPE)
                        .body(reqwest::Body::wrap_stream(ndjson_stream(outgoing.clone())))
                },
                |response| async move {
                    decode_ndjson::<EntitySummary, _, _>(response.bytes_stream())
                        .map_err(|e| match e {
                            NdjsonError::Io(e) => transport(peer, e),
                            NdjsonError::Parse(e) => malformed(peer, e),
                        })
                        .try_collect::<Vec<EntitySummary>>()
                        .await
                },
            )
            .await?;

        debug!(
            process_id,
            peer = %peer,
            sent = count,
            received = summaries.len(),
            "Discovery exchange complete"
        );

        Ok(stream::iter(summaries.into_iter().map(Ok)).boxed())
    }

    async fn fetch_entities(
        &self,
        process_id: &str,
        peer: &PeerIdentity,
        ids: &[String],
    ) -> Result<Vec<Value>, NegotiationFailure> {
        self.call_with_retry(
            process_id,
            peer,
            ENTITIES_PATH,
            &self.issuer,
            |request| request.json(ids),
            |response| async move {
                let body = response.bytes().await.map_err(|e| transport(peer, e))?;
                serde_json::from_slice::<Vec<Value>>(&body).map_err(|e| malformed(peer, e))
            },
        )
        .await
    }
}
