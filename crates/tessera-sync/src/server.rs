//! # Peer Server
//!
//! Inbound side of the peer protocol, served with axum.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST /api/v1/sync/p2p/discovery   NDJSON summaries in, NDJSON out      │
//! │       │                                                                 │
//! │       ├─ verify bearer token (bound to this path)      401 on failure   │
//! │       ├─ require X-Issuer matching the token issuer    400 / 401        │
//! │       ├─ respond: every eligible local summary, streamed                │
//! │       └─ issuer in peer directory? negotiate its summaries in the       │
//! │          background                                                     │
//! │                                                                         │
//! │  POST /api/v1/sync/p2p/entities    JSON ids in, eligible documents out  │
//! │  GET  /health                      "OK"                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Error bodies are plain text.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::TryStreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tessera_core::{EntitySummary, PeerIdentity};

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncOrchestrator;
use crate::protocol::{
    decode_ndjson, ndjson_stream, DISCOVERY_PATH, ENTITIES_PATH, HEALTH_PATH, ISSUER_HEADER,
    NDJSON_CONTENT_TYPE,
};
use crate::token::{extract_bearer_token, PeerClaims, TokenService};

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the peer server.
pub struct ServerState {
    orchestrator: Arc<SyncOrchestrator>,
    tokens: Arc<dyn TokenService>,
}

impl ServerState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, tokens: Arc<dyn TokenService>) -> Self {
        ServerState {
            orchestrator,
            tokens,
        }
    }
}

/// Builds the peer protocol router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(DISCOVERY_PATH, post(discovery_handler))
        .route(ENTITIES_PATH, post(entities_handler))
        .route(HEALTH_PATH, get(health_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// The peer protocol HTTP server.
pub struct PeerServer {
    bind_addr: String,
    state: Arc<ServerState>,
}

/// Handle for controlling a running peer server.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl ServerHandle {
    /// Address the server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shuts down the server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Server shutdown channel closed".into()))
    }
}

impl PeerServer {
    pub fn new(bind_addr: impl Into<String>, state: ServerState) -> Self {
        PeerServer {
            bind_addr: bind_addr.into(),
            state: Arc::new(state),
        }
    }

    /// Binds the listener and serves in the background.
    pub async fn start(self) -> SyncResult<ServerHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = router(self.state.clone());

        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: self.bind_addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| SyncError::BindFailed {
            addr: self.bind_addr.clone(),
            reason: e.to_string(),
        })?;

        info!(addr = %local_addr, "Peer server started");

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Peer server shutting down");
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "Peer server stopped with an error");
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// Summary exchange endpoint.
async fn discovery_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let (claims, issuer) = match authorize(&state, &headers, DISCOVERY_PATH) {
        Ok(caller) => caller,
        Err(rejection) => return rejection,
    };

    let process_id = Uuid::new_v4().to_string();

    let received: Vec<EntitySummary> = match decode_ndjson(body.into_data_stream())
        .try_collect()
        .await
    {
        Ok(received) => received,
        Err(e) => {
            warn!(process_id = %process_id, issuer = %issuer, error = %e, "Unreadable discovery body");
            return plain(StatusCode::BAD_REQUEST, format!("invalid summaries: {}", e));
        }
    };

    debug!(
        process_id = %process_id,
        issuer = %issuer,
        jti = %claims.jti,
        received = received.len(),
        "Discovery request"
    );

    let orchestrator = &state.orchestrator;
    let mut local: Vec<EntitySummary> = Vec::new();
    for entity_type in &orchestrator.settings().entity_types {
        match orchestrator.catalog().summaries(entity_type).await {
            Ok(summaries) => local.extend(summaries),
            Err(e) => {
                error!(process_id = %process_id, entity_type = %entity_type, error = %e, "Failed to build summaries");
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "local catalog unavailable");
            }
        }
    }

    if received.is_empty() {
        debug!(process_id = %process_id, issuer = %issuer, "Caller sent no summaries");
    } else if orchestrator.is_known_peer(&issuer) {
        let orchestrator = orchestrator.clone();
        let peer = issuer.clone();
        let reverse_id = process_id.clone();
        tokio::spawn(async move {
            orchestrator.absorb(&reverse_id, &peer, received).await;
        });
    } else {
        debug!(process_id = %process_id, issuer = %issuer, "Issuer not in peer directory, not negotiating back");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .body(Body::from_stream(ndjson_stream(Arc::from(local))))
        .unwrap_or_else(|e| plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Full-document endpoint.
async fn entities_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (_claims, issuer) = match authorize(&state, &headers, ENTITIES_PATH) {
        Ok(caller) => caller,
        Err(rejection) => return rejection,
    };

    let ids: Vec<String> = match serde_json::from_slice(&body) {
        Ok(ids) => ids,
        Err(e) => return plain(StatusCode::BAD_REQUEST, format!("expected a JSON array of ids: {}", e)),
    };

    match state.orchestrator.catalog().eligible_entities(&ids).await {
        Ok(documents) => {
            debug!(issuer = %issuer, requested = ids.len(), served = documents.len(), "Entities served");
            Json(documents).into_response()
        }
        Err(e) => {
            error!(issuer = %issuer, error = %e, "Failed to load entities");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "local store unavailable")
        }
    }
}

/// Checks the bearer token and the issuer header.
#[allow(clippy::result_large_err)]
fn authorize(
    state: &ServerState,
    headers: &HeaderMap,
    path: &str,
) -> Result<(PeerClaims, PeerIdentity), Response> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| plain(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

    let claims = state.tokens.verify_token(token, path).map_err(|e| {
        warn!(path, error = %e, "Rejected peer token");
        plain(StatusCode::UNAUTHORIZED, "invalid token")
    })?;

    let issuer = headers
        .get(ISSUER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(PeerIdentity::new)
        .ok_or_else(|| plain(StatusCode::BAD_REQUEST, "missing X-Issuer header"))?;

    if PeerIdentity::new(claims.iss.as_str()) != issuer {
        warn!(path, issuer = %issuer, token_issuer = %claims.iss, "Issuer mismatch");
        return Err(plain(StatusCode::UNAUTHORIZED, "issuer does not match token"));
    }

    Ok((claims, issuer))
}

fn plain(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LocalCatalog;
    use crate::client::{HttpPeerClient, PeerGateway, RetryPolicy};
    use crate::error::NegotiationFailure;
    use crate::negotiation::NegotiationEngine;
    use crate::orchestrator::OrchestratorSettings;
    use crate::test_support::{offering, summary_of, FakeGateway};
    use crate::token::JwtTokenService;
    use std::time::Duration;
    use tessera_core::{RawEntity, ReplicationPolicy};
    use tessera_db::{Database, DbConfig, MemoryEntityStore};

    const SECRET: &str = "fleet-secret";
    const CALLER: &str = "https://node-a";

    struct Node {
        handle: ServerHandle,
        store: Arc<MemoryEntityStore>,
        gateway: Arc<FakeGateway>,
        _db: Database,
    }

    impl Node {
        fn identity(&self) -> PeerIdentity {
            PeerIdentity::new(format!("http://{}", self.handle.local_addr()))
        }
    }

    /// Starts a node on an ephemeral port that knows `CALLER` as a peer.
    async fn start_node(local: Vec<serde_json::Value>) -> Node {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let audit = Arc::new(db.audit());
        let store = Arc::new(MemoryEntityStore::with_entities(
            local.into_iter().map(|doc| RawEntity::from_json(doc).unwrap()),
        ));
        let gateway = Arc::new(FakeGateway::default());
        let policy = ReplicationPolicy::default();

        let orchestrator = SyncOrchestrator::new(
            OrchestratorSettings {
                local_domain: "https://node-b".into(),
                entity_types: vec!["product-offering".into()],
                peers: vec![PeerIdentity::new(CALLER)],
            },
            LocalCatalog::new(store.clone(), audit.clone(), policy.clone()),
            gateway.clone(),
            NegotiationEngine::new(gateway.clone(), store.clone(), audit, policy),
            None,
        );

        let tokens = Arc::new(JwtTokenService::new(SECRET, "https://node-b", 60));
        let server = PeerServer::new(
            "127.0.0.1:0",
            ServerState::new(Arc::new(orchestrator), tokens),
        );
        let handle = server.start().await.unwrap();

        Node {
            handle,
            store,
            gateway,
            _db: db,
        }
    }

    fn caller_client(secret: &str) -> HttpPeerClient {
        HttpPeerClient::new(
            Arc::new(JwtTokenService::new(secret, CALLER, 60)),
            CALLER,
            RetryPolicy::new(0, Duration::from_millis(10)),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_discovery_returns_only_eligible_summaries() {
        let node = start_node(vec![
            offering("urn:PO:1", "1.0", "Launched"),
            offering("urn:PO:2", "1.0", "Retired"),
        ])
        .await;

        let stream = caller_client(SECRET)
            .exchange("p-1", &node.identity(), CALLER, Arc::from(Vec::new()))
            .await
            .unwrap();
        let summaries: Vec<EntitySummary> = stream.try_collect().await.unwrap();

        let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["urn:PO:1"]);

        node.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_rejects_foreign_token() {
        let node = start_node(vec![]).await;

        let err = caller_client("not-the-fleet-secret")
            .exchange("p-1", &node.identity(), CALLER, Arc::from(Vec::new()))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, NegotiationFailure::ClientError { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_missing_issuer_is_bad_request() {
        let node = start_node(vec![]).await;
        let tokens = JwtTokenService::new(SECRET, CALLER, 60);
        let url = node.identity().endpoint(DISCOVERY_PATH);

        let response = reqwest::Client::new()
            .post(&url)
            .bearer_auth(tokens.mint_token(&url).unwrap())
            .body("")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 400);
        assert_eq!(response.text().await.unwrap(), "missing X-Issuer header");
    }

    #[tokio::test]
    async fn test_known_caller_summaries_are_negotiated_back() {
        let node = start_node(vec![]).await;
        let caller = PeerIdentity::new(CALLER);

        let pushed = offering("urn:PO:5", "1.0", "Launched");
        node.gateway.serve(&caller, vec![pushed.clone()]);

        let outgoing: Arc<[EntitySummary]> = vec![summary_of(&pushed)].into();
        let stream = caller_client(SECRET)
            .exchange("p-1", &node.identity(), CALLER, outgoing)
            .await
            .unwrap();
        let _: Vec<EntitySummary> = stream.try_collect().await.unwrap();

        let mut applied = false;
        for _ in 0..50 {
            if node.store.get("urn:PO:5").await.is_some() {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(applied);
        assert_eq!(node.gateway.fetch_calls()[0].0, caller);
    }

    #[tokio::test]
    async fn test_entities_endpoint_serves_eligible_documents() {
        let node = start_node(vec![
            offering("urn:PO:1", "1.0", "Launched"),
            offering("urn:PO:2", "1.0", "Retired"),
        ])
        .await;

        let docs = caller_client(SECRET)
            .fetch_entities(
                "p-1",
                &node.identity(),
                &["urn:PO:1".to_string(), "urn:PO:2".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["id"], "urn:PO:1");
    }

    #[tokio::test]
    async fn test_health() {
        let node = start_node(vec![]).await;
        let url = node.identity().endpoint(HEALTH_PATH);
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");
    }
}
