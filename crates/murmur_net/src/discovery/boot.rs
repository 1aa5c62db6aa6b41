//! Boot discovery: a fixed list of bootstrap urls.

use async_trait::async_trait;

use super::{Discovery, DiscoveryKind};
use crate::error::Result;
use crate::peer::PeerDefinition;

#[derive(Debug, Clone, Default)]
pub struct BootDiscovery {
    urls: Vec<String>,
}

impl BootDiscovery {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        let mut boot = Self::default();
        boot.extend(urls);
        boot
    }

    /// Add urls, skipping ones already present.
    pub fn extend(&mut self, urls: impl IntoIterator<Item = String>) {
        for url in urls {
            if !self.urls.contains(&url) {
                self.urls.push(url);
            }
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[async_trait]
impl Discovery for BootDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Boot
    }

    async fn discover(&self) -> Result<Vec<PeerDefinition>> {
        Ok(self
            .urls
            .iter()
            .map(|url| PeerDefinition::from_url(url.clone()))
            .collect())
    }
}
