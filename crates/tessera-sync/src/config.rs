//! # Node Configuration
//!
//! Configuration management for the sync node.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TESSERA_DOMAIN=https://node-a.example.org                          │
//! │     TESSERA_PEERS=https://node-b.example.org,https://node-c...         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tessera/tessera.toml (Linux)                             │
//! │     ~/Library/Application Support/org.tessera.node/tessera.toml        │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Launched-only policy, 3 retries × 1 s, batches of 50               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [node]
//! domain = "https://node-a.example.org"
//! bind_addr = "0.0.0.0"
//! port = 8080
//!
//! [sync]
//! entity_types = ["product-offering", "category", "catalog"]
//! peers = ["https://node-b.example.org"]
//! peer_sync_interval_secs = 600
//! catchup_interval_secs = 60
//! batch_size = 50
//! item_concurrency = 8
//!
//! [policy]
//! allowed_statuses = ["Launched"]
//!
//! [retry]
//! max_retries = 3
//! delay_ms = 1000
//!
//! [ledger]
//! adapter_url = "http://dlt-adapter:8080"
//!
//! [auth]
//! token_secret = "shared-secret-between-peers"
//!
//! [store]
//! backend = "sqlite"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_core::policy::DEFAULT_ALLOWED_STATUS;
use tessera_core::{PeerIdentity, ReplicationPolicy};
use tessera_db::StoreBackend;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Node Settings
// =============================================================================

/// Identity and listening address of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Public base URL of this node. Sent to peers as `X-Issuer`.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// SQLite database file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Address the peer protocol server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port the peer protocol server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_domain() -> String {
    "http://localhost:8080".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            domain: default_domain(),
            database_path: None,
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

impl NodeSettings {
    /// Returns the full bind address (addr:port).
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// What to synchronize, with whom, and how often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Entity types negotiated, in order. One type is processed at a time.
    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<String>,

    /// Peer directory: base URLs of the nodes negotiated with.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Seconds between peer negotiation passes.
    #[serde(default = "default_peer_sync_interval")]
    pub peer_sync_interval_secs: u64,

    /// Seconds between ledger catch-up passes.
    #[serde(default = "default_catchup_interval")]
    pub catchup_interval_secs: u64,

    /// Ledger notifications processed per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Notifications of one batch processed at the same time.
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,
}

fn default_entity_types() -> Vec<String> {
    vec![
        "product-offering".to_string(),
        "category".to_string(),
        "catalog".to_string(),
    ]
}

fn default_peer_sync_interval() -> u64 {
    600
}

fn default_catchup_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_item_concurrency() -> usize {
    8
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            entity_types: default_entity_types(),
            peers: Vec::new(),
            peer_sync_interval_secs: default_peer_sync_interval(),
            catchup_interval_secs: default_catchup_interval(),
            batch_size: default_batch_size(),
            item_concurrency: default_item_concurrency(),
        }
    }
}

// =============================================================================
// Policy Settings
// =============================================================================

/// Replication policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Lifecycle statuses that may be replicated.
    #[serde(default = "default_allowed_statuses")]
    pub allowed_statuses: Vec<String>,
}

fn default_allowed_statuses() -> Vec<String> {
    vec![DEFAULT_ALLOWED_STATUS.to_string()]
}

impl Default for PolicySettings {
    fn default() -> Self {
        PolicySettings {
            allowed_statuses: default_allowed_statuses(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Retry and timeout settings for outbound HTTP calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt (transport failures only).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Whole-request timeout, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connect timeout, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// =============================================================================
// Ledger / Auth / Store Settings
// =============================================================================

/// Distributed ledger adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Base URL of the ledger adapter. Catch-up is disabled when unset.
    #[serde(default)]
    pub adapter_url: Option<String>,
}

/// Bearer token settings for the peer protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret shared by every node of the fleet.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,

    /// Lifetime of minted tokens, in seconds.
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: i64,
}

fn default_token_secret() -> String {
    Uuid::new_v4().simple().to_string()
}

fn default_token_lifetime() -> i64 {
    300
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            token_secret: default_token_secret(),
            token_lifetime_secs: default_token_lifetime(),
        }
    }
}

/// Entity store selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
}

// =============================================================================
// Node Config
// =============================================================================

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub policy: PolicySettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl NodeConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tessera.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading node config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load node config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Node config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        validate_http_url("node.domain", &self.node.domain)?;

        for peer in &self.sync.peers {
            validate_http_url("sync.peers", peer)?;
        }

        if let Some(ref url) = self.ledger.adapter_url {
            validate_http_url("ledger.adapter_url", url)?;
        }

        if self.sync.entity_types.is_empty() {
            return Err(SyncError::InvalidConfig(
                "sync.entity_types must list at least one type".into(),
            ));
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.item_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "item_concurrency must be greater than 0".into(),
            ));
        }

        if self.policy.allowed_statuses.is_empty() {
            return Err(SyncError::InvalidConfig(
                "policy.allowed_statuses must not be empty".into(),
            ));
        }

        if self.auth.token_secret.trim().is_empty() {
            return Err(SyncError::InvalidConfig("auth.token_secret is empty".into()));
        }

        if self.auth.token_lifetime_secs <= 0 {
            return Err(SyncError::InvalidConfig(
                "auth.token_lifetime_secs must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Applies overrides from a variable lookup (the process environment
    /// in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(domain) = lookup("TESSERA_DOMAIN") {
            debug!(domain = %domain, "Overriding node domain from environment");
            self.node.domain = domain;
        }

        if let Some(path) = lookup("TESSERA_DB_PATH") {
            self.node.database_path = Some(PathBuf::from(path));
        }

        if let Some(addr) = lookup("TESSERA_BIND_ADDR") {
            self.node.bind_addr = addr;
        }

        if let Some(port) = lookup("TESSERA_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.node.port = p,
                Err(_) => warn!(port = %port, "Ignoring invalid TESSERA_PORT"),
            }
        }

        if let Some(peers) = lookup("TESSERA_PEERS") {
            self.sync.peers = split_list(&peers);
            debug!(count = self.sync.peers.len(), "Overriding peer directory from environment");
        }

        if let Some(types) = lookup("TESSERA_ENTITY_TYPES") {
            self.sync.entity_types = split_list(&types);
        }

        if let Some(statuses) = lookup("TESSERA_ALLOWED_STATUSES") {
            self.policy.allowed_statuses = split_list(&statuses);
        }

        if let Some(url) = lookup("TESSERA_LEDGER_URL") {
            self.ledger.adapter_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(secret) = lookup("TESSERA_TOKEN_SECRET") {
            self.auth.token_secret = secret;
        }

        if let Some(backend) = lookup("TESSERA_STORE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => self.store.backend = parsed,
                Err(e) => warn!(error = %e, "Ignoring TESSERA_STORE_BACKEND"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("tessera.toml"))
    }

    /// Returns the database path, falling back to the platform data dir.
    pub fn database_path(&self) -> PathBuf {
        self.node
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("tessera.db")))
            .unwrap_or_else(|| PathBuf::from("tessera.db"))
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("org", "tessera", "node")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the peer directory as identities, duplicates removed.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = Vec::with_capacity(self.sync.peers.len());
        for url in &self.sync.peers {
            let peer = PeerIdentity::new(url.as_str());
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        peers
    }

    /// Builds the replication policy.
    pub fn replication_policy(&self) -> ReplicationPolicy {
        ReplicationPolicy::new(self.policy.allowed_statuses.iter().cloned())
    }

    pub fn peer_sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.peer_sync_interval_secs)
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.sync.catchup_interval_secs)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn validate_http_url(field: &str, raw: &str) -> SyncResult<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| SyncError::InvalidUrl(format!("{}: '{}' ({})", field, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SyncError::InvalidUrl(format!(
            "{} must use http or https, got {}: {}",
            field, other, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.delay(), Duration::from_secs(1));
        assert_eq!(config.policy.allowed_statuses, vec!["Launched".to_string()]);
        assert!(!config.auth.token_secret.is_empty());
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_config_validation() {
        let mut config = NodeConfig::default();

        config.sync.peers = vec!["ws://peer".into()];
        assert!(config.validate().is_err());

        config.sync.peers = vec!["https://peer.example.org".into()];
        assert!(config.validate().is_ok());

        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
        config.sync.batch_size = 50;

        config.auth.token_secret = "  ".into();
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_toml_partial_file_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [node]
            domain = "https://node-a.example.org"

            [sync]
            peers = ["https://node-b.example.org/", "https://node-b.example.org"]

            [store]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.port, 8080);
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        // Trailing-slash duplicates collapse to one peer.
        assert_eq!(config.peers().len(), 1);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TESSERA_DOMAIN", "https://override.example.org"),
            ("TESSERA_PEERS", "https://a.example.org, https://b.example.org,"),
            ("TESSERA_PORT", "not-a-port"),
            ("TESSERA_STORE_BACKEND", "memory"),
            ("TESSERA_ALLOWED_STATUSES", "Launched,Active"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.node.domain, "https://override.example.org");
        assert_eq!(config.sync.peers.len(), 2);
        assert_eq!(config.node.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.policy.allowed_statuses.len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");

        let mut config = NodeConfig::default();
        config.node.domain = "https://saved.example.org".into();
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[node]"));
        assert!(contents.contains("[sync]"));

        let loaded: NodeConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.node.domain, "https://saved.example.org");
        assert_eq!(loaded.auth.token_secret, config.auth.token_secret);
    }
}
