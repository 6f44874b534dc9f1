//! Configuration for clustermeta
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file,
//! `CLUSTERMETA__*` environment variables. The server binary applies its CLI
//! flags on top.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "clustermeta.toml";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier of this metadata replica)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for snapshots (in-memory snapshots when unset)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Membership and placement tuning
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "meta-1".to_string()
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8010))
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How a non-empty resource tag constrains selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagPolicy {
    /// Only instances carrying the requested tag are eligible
    #[default]
    Exact,
    /// Fall back to any tag when no eligible instance carries the requested one
    PreferExact,
}

/// Cluster manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Heartbeat silence after which an instance is proposed dead
    #[serde(default = "default_dead_threshold")]
    pub dead_threshold_ms: u64,

    /// Liveness scan period (leader only)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,

    /// How long a submitted mutation may wait for its commit
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_ms: u64,

    /// Period of the background snapshot writer
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,

    #[serde(default)]
    pub tag_policy: TagPolicy,

    /// Let the leader propose `add_instance` for heartbeats from unknown stores
    #[serde(default)]
    pub bootstrap_from_heartbeat: bool,
}

fn default_dead_threshold() -> u64 {
    60_000
}
fn default_health_check_interval() -> u64 {
    10_000
}
fn default_commit_timeout() -> u64 {
    5_000
}
fn default_snapshot_interval() -> u64 {
    300_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            dead_threshold_ms: default_dead_threshold(),
            health_check_interval_ms: default_health_check_interval(),
            commit_timeout_ms: default_commit_timeout(),
            snapshot_interval_ms: default_snapshot_interval(),
            tag_policy: TagPolicy::default(),
            bootstrap_from_heartbeat: false,
        }
    }
}

impl ClusterConfig {
    pub fn dead_threshold(&self) -> Duration {
        Duration::from_millis(self.dead_threshold_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// Reject settings under which the liveness scan would evict healthy stores
    pub fn validate(&self) -> crate::Result<()> {
        if self.health_check_interval_ms == 0 || self.snapshot_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "intervals must be greater than zero".into(),
            ));
        }
        if self.commit_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "commit timeout must be greater than zero".into(),
            ));
        }
        if self.dead_threshold_ms <= self.health_check_interval_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "dead threshold ({}ms) must exceed the health check interval ({}ms)",
                self.dead_threshold_ms, self.health_check_interval_ms
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bind_addr: default_bind_addr(),
            db_path: None,
            cluster: ClusterConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("CLUSTERMETA").separator("__"))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.cluster.validate()?;
        Ok(config)
    }
}
