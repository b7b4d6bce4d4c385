use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::timing;
use crate::task_kind::DEFAULT_EXTERNAL_INTERFACE;

/// When the ledger writes its snapshots
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    /// Rewrite the snapshot inside every mutating operation.
    #[default]
    Immediate,
    /// Mark the table dirty and let a periodic flush write it.
    Deferred,
    /// Memory only.
    Disabled,
}

/// Control-plane server configuration (`FLEET_SERVER_*`)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:20081)
    #[serde(default = "default_server_addr")]
    pub listen_addr: SocketAddr,

    /// Directory holding `agents.json` and `tasks.json`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub persist: PersistMode,

    /// Flush period for [`PersistMode::Deferred`]
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Agents not seen for longer than this receive no work
    #[serde(default = "default_liveness_secs")]
    pub liveness_secs: u64,

    /// Period of the stale-Running sweep; 0 disables it
    #[serde(default)]
    pub sweep_interval_secs: u64,
}

impl ServerConfig {
    #[must_use]
    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_secs)
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Agent runtime configuration (`FLEET_AGENT_*`)
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the control plane
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Overrides the `hostname-ip` identity
    #[serde(default)]
    pub agent_id: Option<String>,

    /// Overrides the `agent-<hostname>` display name
    #[serde(default)]
    pub name: Option<String>,

    /// Upper bound for a single executed command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Interface used by port-forward rules that do not name one
    #[serde(default = "default_external_interface")]
    pub external_interface: String,
}

impl AgentConfig {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

fn default_server_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 20081))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_liveness_secs() -> u64 {
    timing::LIVENESS_THRESHOLD_SECS
}

fn default_server_url() -> String {
    "http://127.0.0.1:20081".to_string()
}

fn default_heartbeat_secs() -> u64 {
    timing::HEARTBEAT_INTERVAL_SECS
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_external_interface() -> String {
    DEFAULT_EXTERNAL_INTERFACE.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_server_addr(),
            data_dir: default_data_dir(),
            persist: PersistMode::default(),
            flush_interval_secs: default_flush_interval_secs(),
            liveness_secs: default_liveness_secs(),
            sweep_interval_secs: 0,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            heartbeat_secs: default_heartbeat_secs(),
            agent_id: None,
            name: None,
            command_timeout_secs: default_command_timeout_secs(),
            external_interface: default_external_interface(),
        }
    }
}
