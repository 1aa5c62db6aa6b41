//! Swarm configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::discovery::DiscoveryConfig;

/// Configuration for one swarm node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Free-form network name, reported in logs.
    pub network_id: String,

    /// Urls dialed at start, merged into the boot discovery method.
    pub boot_peers: Vec<String>,

    /// Soft limit on connected peers. Exceeding it only logs a warning.
    pub max_peers: usize,

    /// Bound on waiting for a remote handshake.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Bound on a peer lookup query.
    #[serde(with = "duration_serde")]
    pub lookup_timeout: Duration,

    /// IPs plugged into each channel's advertised url.
    pub advertise_ips: Vec<String>,

    /// Channels built at swarm construction.
    pub channels: Vec<ChannelConfig>,

    /// Discovery methods built at swarm construction.
    pub discovery: Vec<DiscoveryConfig>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            network_id: String::new(),
            boot_peers: Vec::new(),
            max_peers: 25,
            handshake_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(10),
            advertise_ips: vec!["127.0.0.1".to_string()],
            channels: Vec::new(),
            discovery: Vec::new(),
        }
    }
}

impl SwarmConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if it is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<SwarmConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
