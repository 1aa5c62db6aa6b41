//! In-process channel (`mem://name`).
//!
//! Every [`MemoryChannel`] created from the same [`MemoryNetwork`] can dial
//! the others by name. Streams are `tokio::io::duplex` pipes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BoxedStream, Channel, ChannelKind, IncomingStream};
use crate::error::{NetworkError, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Shared registry of listening memory channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<IncomingStream>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel reachable at `mem://{name}` on this network.
    pub fn channel(&self, name: impl Into<String>) -> MemoryChannel {
        MemoryChannel {
            name: name.into(),
            network: self.clone(),
            dialed: AtomicU64::new(0),
            registered: Mutex::new(None),
        }
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners.lock().contains_key(name)
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    name: String,
    network: MemoryNetwork,
    dialed: AtomicU64,
    registered: Mutex<Option<mpsc::Sender<IncomingStream>>>,
}

impl MemoryChannel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Memory
    }

    async fn up(&self, incoming: mpsc::Sender<IncomingStream>) -> Result<()> {
        let mut listeners = self.network.listeners.lock();
        if let Some(existing) = listeners.get(&self.name) {
            if existing.same_channel(&incoming) {
                return Ok(());
            }
            return Err(NetworkError::Config(format!(
                "mem://{} is already listening",
                self.name
            )));
        }
        listeners.insert(self.name.clone(), incoming.clone());
        *self.registered.lock() = Some(incoming);
        debug!("Memory channel mem://{} up", self.name);
        Ok(())
    }

    /// Only unregisters the name if this channel is the one listening on it.
    async fn down(&self) {
        let Some(registered) = self.registered.lock().take() else {
            return;
        };
        let mut listeners = self.network.listeners.lock();
        if listeners
            .get(&self.name)
            .is_some_and(|current| current.same_channel(&registered))
        {
            listeners.remove(&self.name);
            debug!("Memory channel mem://{} down", self.name);
        }
    }

    async fn connect(&self, url: &str) -> Result<BoxedStream> {
        let target = url
            .strip_prefix("mem://")
            .ok_or_else(|| NetworkError::Dial(format!("Not a mem url: {url}")))?;
        let listener = self
            .network
            .listeners
            .lock()
            .get(target)
            .cloned()
            .ok_or_else(|| NetworkError::Dial(format!("Nothing listening on {url}")))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let n = self.dialed.fetch_add(1, Ordering::Relaxed);
        let accepted = IncomingStream {
            url: format!("mem://{}#{n}", self.name),
            stream: Box::new(remote),
        };
        listener
            .send(accepted)
            .await
            .map_err(|_| NetworkError::Dial(format!("{url} stopped accepting")))?;
        Ok(Box::new(local))
    }

    fn format_url(&self, _ip: &str) -> String {
        format!("mem://{}", self.name)
    }
}
