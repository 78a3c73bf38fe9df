//! # Sync Orchestrator
//!
//! Drives peer negotiation and ledger catch-up.
//!
//! ## Peer Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for entity_type in [product-offering, category, catalog]  (in order)   │
//! │      │                                                                  │
//! │      ├─► catalog.index(type)              every stored entity           │
//! │      ├─► catalog.advertised(index)        eligible subset, sent out     │
//! │      │                                                                  │
//! │      ├─► exchange(peer A) ┐                                             │
//! │      ├─► exchange(peer B) ├─ concurrently; a failed exchange becomes    │
//! │      ├─► exchange(peer C) ┘  that peer's outcome                        │
//! │      │                                                                  │
//! │      └─► NegotiationEngine::negotiate(streams) ─► TypeReport            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Negotiation compares against the full index, so an entity kept
//! locally but not advertised (retired, expired) is never re-fetched
//! from an older remote copy.
//!
//! ## Background Loop
//! Peer passes and catch-up passes run as separate tasks, each on its own
//! interval, and stop together on shutdown. A slow peer pass never delays
//! a catch-up tick. Every pass gets a fresh process id that tags its logs
//! and audit records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tessera_core::{EntitySummary, PeerIdentity};

use crate::catalog::LocalCatalog;
use crate::catchup::{CatchupReport, LedgerCatchupWorker};
use crate::client::{PeerGateway, SummaryStream};
use crate::config::NodeConfig;
use crate::error::{SyncError, SyncResult};
use crate::negotiation::{NegotiationEngine, PeerOutcome};

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one entity type within a peer pass.
#[derive(Debug, Default)]
pub struct TypeReport {
    pub entity_type: String,
    /// Eligible local summaries advertised. Negotiation itself runs
    /// against every stored entity of the type.
    pub advertised: usize,
    /// One outcome per peer, ordered by peer.
    pub outcomes: Vec<PeerOutcome>,
    /// Set when the local summaries could not be built.
    pub error: Option<String>,
}

/// Outcome of one peer pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub process_id: String,
    pub types: Vec<TypeReport>,
}

impl SyncReport {
    /// Entities published across every type and peer.
    pub fn published(&self) -> usize {
        self.outcomes()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|r| r.published)
            .sum()
    }

    /// Number of (type, peer) negotiations that failed.
    pub fn failed_negotiations(&self) -> usize {
        self.outcomes().filter(|o| o.result.is_err()).count()
    }

    fn outcomes(&self) -> impl Iterator<Item = &PeerOutcome> {
        self.types.iter().flat_map(|t| t.outcomes.iter())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// What the orchestrator synchronizes and with whom.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Sent to peers as `X-Issuer`.
    pub local_domain: String,
    pub entity_types: Vec<String>,
    pub peers: Vec<PeerIdentity>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        OrchestratorSettings {
            local_domain: config.node.domain.clone(),
            entity_types: config.sync.entity_types.clone(),
            peers: config.peers(),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Entry point of both synchronization channels.
pub struct SyncOrchestrator {
    settings: OrchestratorSettings,
    catalog: LocalCatalog,
    gateway: Arc<dyn PeerGateway>,
    engine: NegotiationEngine,
    catchup: Option<LedgerCatchupWorker>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator. Without a catch-up worker the ledger
    /// channel is disabled.
    pub fn new(
        settings: OrchestratorSettings,
        catalog: LocalCatalog,
        gateway: Arc<dyn PeerGateway>,
        engine: NegotiationEngine,
        catchup: Option<LedgerCatchupWorker>,
    ) -> Self {
        SyncOrchestrator {
            settings,
            catalog,
            gateway,
            engine,
            catchup,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &LocalCatalog {
        &self.catalog
    }

    /// Returns true if `peer` is in the peer directory.
    pub fn is_known_peer(&self, peer: &PeerIdentity) -> bool {
        self.settings.peers.contains(peer)
    }

    /// Runs one peer pass over every configured type, one type at a time.
    ///
    /// Never fails: peer and item failures are reported per type.
    pub async fn synchronize(&self, process_id: &str) -> SyncReport {
        info!(
            process_id,
            peers = self.settings.peers.len(),
            types = self.settings.entity_types.len(),
            "Starting peer synchronization"
        );

        let mut report = SyncReport {
            process_id: process_id.to_string(),
            types: Vec::with_capacity(self.settings.entity_types.len()),
        };

        for entity_type in &self.settings.entity_types {
            let type_report = self
                .sync_type(process_id, entity_type, &self.settings.peers)
                .await;
            report.types.push(type_report);
        }

        info!(
            process_id,
            published = report.published(),
            failed = report.failed_negotiations(),
            "Peer synchronization finished"
        );
        report
    }

    /// Negotiates one entity type with the given peers.
    pub async fn sync_type(
        &self,
        process_id: &str,
        entity_type: &str,
        peers: &[PeerIdentity],
    ) -> TypeReport {
        let mut report = TypeReport {
            entity_type: entity_type.to_string(),
            ..TypeReport::default()
        };

        let index = match self.catalog.index(entity_type).await {
            Ok(index) => index,
            Err(e) => {
                error!(process_id, entity_type, error = %e, "Failed to build local summaries");
                report.error = Some(e.to_string());
                return report;
            }
        };
        let outgoing: Arc<[EntitySummary]> = self.catalog.advertised(&index).into();
        report.advertised = outgoing.len();

        if peers.is_empty() {
            debug!(process_id, entity_type, "No peers configured");
            return report;
        }

        let domain = self.settings.local_domain.as_str();

        let exchanges = join_all(peers.iter().cloned().map(|peer| {
            let outgoing = outgoing.clone();
            async move {
                let result = self
                    .gateway
                    .exchange(process_id, &peer, domain, outgoing)
                    .await;
                (peer, result)
            }
        }))
        .await;

        let mut streams: HashMap<PeerIdentity, SummaryStream> = HashMap::new();
        let mut failed: Vec<PeerOutcome> = Vec::new();
        for (peer, result) in exchanges {
            match result {
                Ok(stream) => {
                    streams.insert(peer, stream);
                }
                Err(failure) => {
                    warn!(
                        process_id,
                        peer = %peer,
                        entity_type,
                        error = %failure,
                        "Discovery exchange failed"
                    );
                    failed.push(PeerOutcome {
                        peer,
                        result: Err(SyncError::from(failure)),
                    });
                }
            }
        }

        let mut outcomes = self
            .engine
            .negotiate(process_id, entity_type, &index, streams)
            .await;
        outcomes.extend(failed);
        outcomes.sort_by(|a, b| a.peer.cmp(&b.peer));

        report.outcomes = outcomes;
        report
    }

    /// Negotiates against summaries a peer pushed to us during discovery.
    ///
    /// Summaries of types this node does not synchronize are dropped.
    pub async fn absorb(
        &self,
        process_id: &str,
        peer: &PeerIdentity,
        summaries: Vec<EntitySummary>,
    ) -> Vec<TypeReport> {
        let mut by_type: HashMap<String, Vec<EntitySummary>> = HashMap::new();
        for summary in summaries {
            by_type
                .entry(summary.entity_type.clone())
                .or_default()
                .push(summary);
        }

        let mut reports = Vec::new();
        for entity_type in &self.settings.entity_types {
            let Some(remote) = by_type.remove(entity_type) else {
                continue;
            };

            let mut report = TypeReport {
                entity_type: entity_type.clone(),
                ..TypeReport::default()
            };

            match self.catalog.index(entity_type).await {
                Ok(index) => {
                    report.advertised = self.catalog.advertised(&index).len();
                    let stream: SummaryStream = stream::iter(remote.into_iter().map(Ok)).boxed();
                    let streams = HashMap::from([(peer.clone(), stream)]);
                    report.outcomes = self
                        .engine
                        .negotiate(process_id, entity_type, &index, streams)
                        .await;
                }
                Err(e) => {
                    error!(process_id, entity_type, error = %e, "Failed to build local summaries");
                    report.error = Some(e.to_string());
                }
            }
            reports.push(report);
        }
        reports
    }

    /// Runs one ledger catch-up cycle. `None` when the ledger is disabled.
    pub async fn catch_up(&self, process_id: &str) -> SyncResult<Option<CatchupReport>> {
        match &self.catchup {
            Some(worker) => worker.run_cycle(process_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Runs both passes on their intervals until `shutdown_rx` fires.
    ///
    /// The peer pass and the catch-up pass are separate tasks; a pass in
    /// progress at shutdown is allowed to finish.
    pub async fn run(
        self: Arc<Self>,
        peer_interval: Duration,
        catchup_interval: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Sync orchestrator starting");

        let (stop_tx, stop_rx) = watch::channel(false);

        let mut tasks = vec![tokio::spawn(
            self.clone().peer_loop(peer_interval, stop_rx.clone()),
        )];
        if self.catchup.is_some() {
            tasks.push(tokio::spawn(self.clone().catchup_loop(catchup_interval, stop_rx)));
        } else {
            debug!("Ledger channel disabled");
        }

        // A dropped handle counts as shutdown.
        shutdown_rx.recv().await;
        info!("Sync orchestrator shutting down");
        if stop_tx.send(true).is_err() {
            debug!("Sync tasks already stopped");
        }

        for task in join_all(tasks).await {
            if let Err(e) = task {
                error!(error = %e, "Sync task failed");
            }
        }

        info!("Sync orchestrator stopped");
    }

    async fn peer_loop(self: Arc<Self>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let process_id = Uuid::new_v4().to_string();
                    self.synchronize(&process_id).await;
                }

                _ = stop_rx.changed() => break,
            }
        }
        debug!("Peer loop stopped");
    }

    async fn catchup_loop(self: Arc<Self>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let process_id = Uuid::new_v4().to_string();
                    if let Err(e) = self.catch_up(&process_id).await {
                        error!(process_id = %process_id, error = %e, "Ledger catch-up failed");
                    }
                }

                _ = stop_rx.changed() => break,
            }
        }
        debug!("Catch-up loop stopped");
    }

    /// Spawns [`SyncOrchestrator::run`] as a background task.
    pub fn spawn(
        self: Arc<Self>,
        peer_interval: Duration,
        catchup_interval: Duration,
    ) -> OrchestratorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.run(peer_interval, catchup_interval, shutdown_rx));
        OrchestratorHandle { shutdown_tx, task }
    }
}

/// Handle for stopping a spawned orchestrator.
pub struct OrchestratorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Stops both loops and waits for any running pass to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))?;

        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("Orchestrator task failed: {}", e)))
    }
}
