//! Typed configuration surface, parsed from a TOML file (see `§6.4` in SPEC_FULL.md).

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{KeeperError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub my_id: u64,
    pub endpoint: String,
    /// Address this node listens on for Raft gossip and forwarded-request traffic (`cluster`,
    /// `forwarder`). Kept separate from `endpoint` because the client wire protocol (`§6.1`) must
    /// stay bit-compatible and has no room for a channel-kind prefix byte. Defaults to `endpoint`
    /// with the port incremented by one.
    #[serde(default)]
    pub peer_endpoint: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: u64,
    /// The peer's internal (Raft + forwarder) endpoint, not its client-facing one.
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub voting: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub max_node_size: usize,
    pub snapshot_distance: u64,
    pub keep_snapshots: usize,
    pub operation_timeout_ms: u64,
    pub session_sync_period_ms: u64,
    pub batch_linger_ms: u64,
    pub max_batch_size: usize,
    pub snapshot_save_batch_size: usize,
    pub allow_follower_reads: bool,
    pub min_session_timeout_ms: u64,
    pub max_session_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_node_size: 1024 * 1024,
            snapshot_distance: 100_000,
            keep_snapshots: 3,
            operation_timeout_ms: 10_000,
            session_sync_period_ms: 500,
            batch_linger_ms: 5,
            max_batch_size: 256,
            snapshot_save_batch_size: 10_000,
            allow_follower_reads: true,
            min_session_timeout_ms: 4_000,
            max_session_timeout_ms: 40_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub segment_max_bytes: u64,
    pub fsync_interval_entries: u64,
    pub fsync_interval_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 64 * 1024 * 1024,
            fsync_interval_entries: 1,
            fsync_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub max_pending_per_lane: usize,
    pub lane_count: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_pending_per_lane: 1024,
            lane_count: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| KeeperError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.coordination.keep_snapshots == 0 {
            return Err(KeeperError::Config(
                "coordination.keep_snapshots must be >= 1".to_string(),
            ));
        }
        if self.coordination.max_batch_size == 0 {
            return Err(KeeperError::Config(
                "coordination.max_batch_size must be >= 1".to_string(),
            ));
        }
        if self.forwarder.lane_count == 0 {
            return Err(KeeperError::Config(
                "forwarder.lane_count must be >= 1".to_string(),
            ));
        }
        if self
            .server
            .peers
            .iter()
            .any(|p| p.id == self.server.my_id)
        {
            return Err(KeeperError::Config(
                "server.peers must not include server.my_id".to_string(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &str {
        if self.server.data_dir.is_empty() {
            "./data"
        } else {
            &self.server.data_dir
        }
    }

    /// This node's internal (Raft + forwarder) listen address; derived from `server.endpoint` by
    /// incrementing the port when `server.peer_endpoint` is left unset.
    pub fn peer_endpoint(&self) -> Result<String> {
        if !self.server.peer_endpoint.is_empty() {
            return Ok(self.server.peer_endpoint.clone());
        }
        bump_port(&self.server.endpoint)
    }
}

fn bump_port(endpoint: &str) -> Result<String> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        KeeperError::Config(format!("endpoint {} is not host:port", endpoint))
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| KeeperError::Config(format!("endpoint {} has a non-numeric port", endpoint)))?;
    Ok(format!("{}:{}", host, port.wrapping_add(1)))
}
