//! # Tessera Node
//!
//! Entity synchronization daemon.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  NodeConfig::load  (defaults ─► tessera.toml ─► TESSERA_* env)          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database (SQLite + migrations) ─► EntityStore / AuditLedger            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  HttpPeerClient, LedgerCatchupWorker (if a ledger adapter is set)       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PeerServer (axum)  +  SyncOrchestrator loop                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Ctrl-C / SIGTERM ─► stop loop ─► stop server ─► close pool             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The config file path is the first argument, else `TESSERA_CONFIG`, else
//! the platform default.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tessera_core::{AuditStatus, SyncSource};
use tessera_db::{open_store, AuditLedger, Database, DbConfig};
use tessera_sync::{
    HttpEntityRetriever, HttpLedgerAdapter, HttpPeerClient, JwtTokenService, LedgerCatchupWorker,
    LocalCatalog, NegotiationEngine, NodeConfig, OrchestratorSettings, PeerGateway, PeerServer,
    ServerState, SyncOrchestrator, TokenService,
};

const DEFAULT_LOG_FILTER: &str = "info,tessera=debug,sqlx=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Tessera node...");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TESSERA_CONFIG").ok())
        .map(PathBuf::from);
    let config = NodeConfig::load(config_path).context("Failed to load node configuration")?;
    info!(
        domain = %config.node.domain,
        peers = config.sync.peers.len(),
        entity_types = ?config.sync.entity_types,
        store = %config.store.backend,
        "Configuration loaded"
    );

    // Open database
    let db = Database::new(DbConfig::new(config.database_path()))
        .await
        .context("Failed to open database")?;

    let store = open_store(config.store.backend, &db);
    let audit: Arc<dyn AuditLedger> = Arc::new(db.audit());
    let policy = config.replication_policy();

    // Peer channel
    let tokens: Arc<dyn TokenService> = Arc::new(JwtTokenService::new(
        config.auth.token_secret.clone(),
        config.node.domain.clone(),
        config.auth.token_lifetime_secs,
    ));
    let gateway: Arc<dyn PeerGateway> =
        Arc::new(HttpPeerClient::from_config(&config, tokens.clone())?);

    let catalog = LocalCatalog::new(store.clone(), audit.clone(), policy.clone());
    let engine = NegotiationEngine::new(gateway.clone(), store.clone(), audit.clone(), policy);

    // Ledger channel
    let catchup = match config.ledger.adapter_url.as_deref() {
        Some(url) => {
            let adapter = HttpLedgerAdapter::new(url, config.retry.request_timeout())?;
            let retriever = HttpEntityRetriever::new(
                config.retry.request_timeout(),
                config.retry.connect_timeout(),
            )?;
            info!(adapter = %url, "Ledger catch-up enabled");
            Some(
                LedgerCatchupWorker::new(
                    Arc::new(adapter),
                    Arc::new(retriever),
                    audit.clone(),
                    store.clone(),
                )
                .batch_size(config.sync.batch_size)
                .item_concurrency(config.sync.item_concurrency),
            )
        }
        None => {
            warn!("No ledger adapter configured, catch-up disabled");
            None
        }
    };

    let orchestrator = Arc::new(SyncOrchestrator::new(
        OrchestratorSettings::from_config(&config),
        catalog,
        gateway,
        engine,
        catchup,
    ));

    // Start peer server
    let server = PeerServer::new(
        config.node.bind_address(),
        ServerState::new(orchestrator.clone(), tokens),
    )
    .start()
    .await?;
    info!(addr = %server.local_addr(), "Peer protocol listening");

    // Start sync loop
    let sync = orchestrator.spawn(config.peer_sync_interval(), config.catchup_interval());

    shutdown_signal().await;

    if let Err(e) = sync.shutdown().await {
        error!(error = %e, "Sync loop did not stop cleanly");
    }
    if let Err(e) = server.shutdown().await {
        error!(error = %e, "Peer server did not stop cleanly");
    }
    log_audit_stats(&db).await;
    db.close().await;

    info!("Node shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Logs how many revisions each channel has published so far.
async fn log_audit_stats(db: &Database) {
    let audit = db.audit();
    for source in [SyncSource::Peer, SyncSource::Ledger] {
        match audit.count_by_status(AuditStatus::Published, Some(source)).await {
            Ok(count) => info!(source = %source.as_str(), published = count, "Audit ledger totals"),
            Err(e) => warn!(source = %source.as_str(), error = %e, "Failed to read audit totals"),
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
