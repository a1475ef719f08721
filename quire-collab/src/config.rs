//! Server configuration, loaded from TOML.
//!
//! Every section is optional; a missing key takes its default.
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! compact_interval_secs = 3600
//!
//! [store]
//! path = "/var/lib/quire"
//!
//! [worker]
//! document_ttl_secs = 86400
//!
//! [[directory.users]]
//! id = "u1"
//! name = "alice"
//! tokens = ["secret"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::DirectoryConfig;
use crate::gateway::GatewayConfig;
use crate::storage::StoreConfig;
use crate::worker::WorkerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: String,
    /// Path prefix of the WebSocket route; the rest of the path is the room.
    pub route_prefix: String,
    /// Relay queue length per room before slow sessions start lagging.
    pub broadcast_capacity: usize,
    /// Compact every room on this period. `None` disables it.
    pub compact_interval_secs: Option<u64>,
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub directory: DirectoryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            route_prefix: "/ws/yjs/".to_string(),
            broadcast_capacity: 256,
            compact_interval_secs: None,
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
            worker: WorkerConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Ephemeral port, store under `path`, short timeouts.
    pub fn for_testing(path: impl AsRef<Path>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            gateway: GatewayConfig::for_testing(),
            store: StoreConfig::for_testing(path.as_ref()),
            worker: WorkerConfig::for_testing(),
            ..Self::default()
        }
    }
}
