/// Config schema types (server, routing, state).
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub state: StateConfig,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
        }
    }
}

/// Timeouts governing calls and connection liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Deadline for a forwarded RPC call before a synthetic error is sent.
    pub rpc_timeout_ms: u64,
    /// A host silent for longer than this loses its agent types to a
    /// re-registering connection.
    pub liveness_timeout_ms: u64,
    /// How often the gateway pings each host.
    pub heartbeat_interval_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: agentgate_protocol::DEFAULT_RPC_TIMEOUT_MS,
            liveness_timeout_ms: agentgate_protocol::LIVENESS_TIMEOUT_MS,
            heartbeat_interval_ms: agentgate_protocol::HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl RoutingConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Which backend holds agent state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    /// SQLite database file. Defaults to `<data_dir>/state.db`.
    pub path: Option<PathBuf>,
}
