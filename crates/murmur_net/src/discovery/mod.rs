//! Ways of finding peers.
//!
//! A discovery method may offer a list of peers to connect to at start
//! ([`Discovery::discover`]) and may resolve an address to a definition on
//! demand ([`Discovery::lookup`]). The swarm keeps at most one method per
//! [`DiscoveryKind`].

pub mod boot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};
use crate::identity::Address;
use crate::peer::PeerDefinition;

pub use boot::BootDiscovery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryKind {
    Boot,
    PeerLookup,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    fn kind(&self) -> DiscoveryKind;

    /// Peers worth connecting to when the swarm starts.
    async fn discover(&self) -> Result<Vec<PeerDefinition>> {
        Ok(Vec::new())
    }

    /// Resolve an address. Methods that cannot look up always fail, so they
    /// never win a lookup race.
    async fn lookup(&self, address: &Address) -> Result<PeerDefinition> {
        Err(NetworkError::PeerNotFound(format!(
            "{:?} discovery does not support lookup of {address}",
            self.kind()
        )))
    }

    /// Drop anything remembered about `address`, e.g. after it proved unreachable.
    fn forget(&self, _address: &Address) {}
}

/// Discovery methods accepted in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    Boot {
        #[serde(default)]
        urls: Vec<String>,
    },
}

impl DiscoveryConfig {
    /// Fold every boot entry, plus `boot_peers`, into a single boot config.
    pub fn merge_boot(
        boot_peers: &[String],
        configs: &[DiscoveryConfig],
    ) -> Vec<DiscoveryConfig> {
        let mut boot_urls = boot_peers.to_vec();
        for config in configs {
            match config {
                Self::Boot { urls } => boot_urls.extend(urls.iter().cloned()),
            }
        }
        if boot_urls.is_empty() {
            Vec::new()
        } else {
            vec![Self::Boot { urls: boot_urls }]
        }
    }

    pub fn build(&self) -> Box<dyn Discovery> {
        match self {
            Self::Boot { urls } => Box::new(BootDiscovery::new(urls.clone())),
        }
    }
}
