//! Named protocol handlers multiplexed over every session.
//!
//! Inbound records are routed by their app name to the matching [`App`].
//! Each app gets an [`AppContext`] on `up` that lets it talk back to the
//! swarm without keeping it alive.

pub mod peer_lookup;
pub(crate) mod registry;

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::discovery::{Discovery, DiscoveryKind};
use crate::error::{NetworkError, Result};
use crate::identity::Address;
use crate::peer::PeerDefinition;
use crate::swarm::{Swarm, SwarmInner};

pub use peer_lookup::PeerLookup;

/// A decrypted record addressed to one app.
#[derive(Debug, Clone, PartialEq)]
pub struct AppMessage {
    pub address: Address,
    pub command: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait App: Send + Sync + 'static {
    /// Unique, non-empty, and free of `:` and newlines.
    fn name(&self) -> &str;

    async fn up(&self, _ctx: AppContext) -> Result<()> {
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        Ok(())
    }

    async fn on_message(&self, message: AppMessage) -> Result<()>;
}

/// An app's handle on the swarm that started it.
#[derive(Clone)]
pub struct AppContext {
    app: String,
    swarm: Weak<SwarmInner>,
}

impl AppContext {
    pub(crate) fn new(app: impl Into<String>, swarm: Weak<SwarmInner>) -> Self {
        Self {
            app: app.into(),
            swarm,
        }
    }

    fn swarm(&self) -> Result<Swarm> {
        self.swarm
            .upgrade()
            .map(Swarm::from_inner)
            .ok_or_else(|| NetworkError::NotConnected("swarm has been dropped".into()))
    }

    pub fn app_name(&self) -> &str {
        &self.app
    }

    /// The local node's address, while the swarm is running.
    pub fn address(&self) -> Option<Address> {
        self.swarm().ok()?.address()
    }

    pub fn add_discovery(&self, method: Arc<dyn Discovery>) {
        if let Ok(swarm) = self.swarm() {
            swarm.add_discovery(method);
        }
    }

    pub fn remove_discovery(&self, kind: DiscoveryKind) {
        if let Ok(swarm) = self.swarm() {
            swarm.remove_discovery(kind);
        }
    }

    /// Send `command` to every connected peer running this app.
    pub async fn broadcast(&self, command: &str, payload: &serde_json::Value) -> usize {
        match self.swarm() {
            Ok(swarm) => swarm.broadcast(&self.app, command, payload).await,
            Err(_) => 0,
        }
    }

    /// Send `command` to this app on the peer at `address`.
    pub async fn send(
        &self,
        address: &Address,
        command: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.swarm()?
            .send(address, &self.app, command, payload)
            .await
    }

    /// Send to this app on `address` only if that peer is connected now.
    /// Never goes through discovery. Returns `false` when the peer is gone.
    pub async fn reply(
        &self,
        address: &Address,
        command: &str,
        payload: &serde_json::Value,
    ) -> Result<bool> {
        let Some(peer) = self.swarm()?.get_peer(address).filter(|p| p.connected()) else {
            return Ok(false);
        };
        peer.send(&self.app, command, payload).await?;
        Ok(true)
    }

    /// Definition of a peer currently in the swarm's table.
    pub fn peer_definition(&self, address: &Address) -> Option<PeerDefinition> {
        self.swarm().ok()?.get_peer_definition(address)
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").field("app", &self.app).finish()
    }
}

/// Check an app name against the wire format's field rules.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(NetworkError::Config(
            "App name must not be empty (reserved for the system app)".into(),
        ));
    }
    if name.contains(':') || name.contains('\n') {
        return Err(NetworkError::Config(format!(
            "App name {name:?} must not contain ':' or newline"
        )));
    }
    Ok(())
}
