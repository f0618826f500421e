//! Client configuration

use crate::error::{Result, SessionError};
use huddle_mesh::{IceServer, MeshConfig};
use huddle_transport::{ReconnectPolicy, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session configuration, usually loaded from TOML.
///
/// ```toml
/// relay_url = "wss://collab.example.com/ws"
/// presence_timeout_ms = 30000
///
/// [reconnect]
/// base_delay_ms = 1000
/// max_delay_ms = 30000
/// max_attempts = 5
///
/// [[ice_servers]]
/// urls = ["stun:stun.l.google.com:19302"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub relay_url: String,
    pub reconnect: ReconnectPolicy,
    pub ice_servers: Vec<IceServer>,
    pub presence_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:7070/collab".to_string(),
            reconnect: ReconnectPolicy::default(),
            ice_servers: MeshConfig::default().ice_servers,
            presence_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SessionError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Awareness renewal period, half the presence timeout
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.presence_timeout_ms / 2).max(1))
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(self.relay_url.clone()).with_reconnect(self.reconnect.clone())
    }

    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}
