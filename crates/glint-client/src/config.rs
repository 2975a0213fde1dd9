//! Client configuration, loadable from TOML.

use std::path::{Path, PathBuf};

use glint_core::types::beacon::{Root, MAX_REQUEST_LIGHT_CLIENT_UPDATES};
use glint_core::types::spec::ChainSpec;
use glint_core::{parse_checkpoint_hash, CheckpointError};
use glint_p2p::{PeerManagerConfig, RpcConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level client settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Network preset: `mainnet` or `minimal`.
    pub network: String,
    /// Genesis time override, for presets without a fixed genesis.
    pub genesis_time: Option<u64>,
    /// Block root to bootstrap from when no persisted state exists.
    pub checkpoint: Option<String>,
    /// Where verified state is persisted across restarts.
    pub data_dir: Option<PathBuf>,
    pub sync: SyncConfig,
    pub peers: PeerManagerConfig,
    pub rpc: RpcConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".into(),
            genesis_time: None,
            checkpoint: None,
            data_dir: None,
            sync: SyncConfig::default(),
            peers: PeerManagerConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

/// Sync state machine settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Peers tried for one bootstrap before giving up.
    pub bootstrap_retries: usize,
    /// Peers tried for one batch of period updates before giving up.
    pub request_retries: usize,
    /// Periods asked for per range request.
    pub max_updates_per_request: u64,
    /// Fetch the next committee once the clock is this close to a period boundary.
    pub sync_lookahead_slots: u64,
    pub tick_interval_ms: u64,
    /// Wait between attempts when no peer is eligible.
    pub retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bootstrap_retries: 4,
            request_retries: 4,
            max_updates_per_request: 16,
            sync_lookahead_slots: 32,
            tick_interval_ms: 1_000,
            retry_delay_ms: 500,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn chain_spec(&self) -> Result<ChainSpec, ConfigError> {
        let mut spec = ChainSpec::from_name(&self.network, self.genesis_time)
            .ok_or_else(|| ConfigError::UnknownNetwork(self.network.clone()))?;
        if let Some(genesis_time) = self.genesis_time {
            spec.genesis_time = genesis_time;
        }
        Ok(spec)
    }

    /// The configured checkpoint, parsed.
    pub fn checkpoint_root(&self) -> Result<Option<Root>, ConfigError> {
        self.checkpoint
            .as_deref()
            .map(parse_checkpoint_hash)
            .transpose()
            .map_err(ConfigError::from)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chain_spec()?;
        self.checkpoint_root()?;

        if self.sync.max_updates_per_request == 0
            || self.sync.max_updates_per_request > MAX_REQUEST_LIGHT_CLIENT_UPDATES
        {
            return Err(ConfigError::Invalid(format!(
                "sync.max_updates_per_request must be between 1 and {}",
                MAX_REQUEST_LIGHT_CLIENT_UPDATES
            )));
        }
        if self.sync.bootstrap_retries == 0 || self.sync.request_retries == 0 {
            return Err(ConfigError::Invalid("retry counts must be positive".into()));
        }
        if self.sync.tick_interval_ms == 0 || self.peers.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.peers.min_peers > self.peers.target_peers {
            return Err(ConfigError::Invalid(
                "peers.min_peers cannot exceed peers.target_peers".into(),
            ));
        }
        if self.rpc.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "rpc.max_concurrent_requests must be positive".into(),
            ));
        }
        self.peers
            .score
            .validate()
            .map_err(|reason| ConfigError::Invalid(reason.into()))
    }
}
