//! Peer — a remote node and its (optional) live session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{NetworkError, Result};
use crate::identity::{Address, Identity};
use crate::session::Session;
use crate::wire::Advertisement;

/// Serializable description of a peer, as exchanged by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub apps: Vec<String>,
}

impl PeerDefinition {
    /// A definition that only knows where to dial.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Self::default()
        }
    }
}

impl From<Advertisement> for PeerDefinition {
    fn from(adv: Advertisement) -> Self {
        Self {
            address: Some(adv.address),
            public_key: Some(adv.public_key),
            urls: adv.urls,
            apps: adv.apps,
        }
    }
}

#[derive(Debug, Default)]
struct PeerInfo {
    address: Option<Address>,
    public_key: Option<String>,
    urls: Vec<String>,
    apps: Vec<String>,
    connected_at: Option<DateTime<Utc>>,
}

/// A remote node. Addressless until its handshake completes, unless built
/// from a definition that already names it.
#[derive(Debug, Default)]
pub struct Peer {
    info: RwLock<PeerInfo>,
    session: RwLock<Option<Arc<Session>>>,
}

impl Peer {
    pub fn from_url(url: impl Into<String>) -> Self {
        let peer = Self::default();
        peer.info.write().urls.push(url.into());
        peer
    }

    /// Build from a definition. A supplied public key must hash to the
    /// supplied address.
    pub fn from_definition(def: PeerDefinition) -> Result<Self> {
        let mut address = def.address;
        if let Some(public_key) = &def.public_key {
            let derived = Identity::from_public_key(public_key)?.address().clone();
            match &address {
                Some(claimed) if claimed != &derived => {
                    return Err(NetworkError::Config(format!(
                        "Definition address {claimed} does not match its public key ({derived})"
                    )));
                }
                _ => address = Some(derived),
            }
        }
        if address.is_none() && def.urls.is_empty() {
            return Err(NetworkError::Config(
                "Peer definition needs an address or at least one url".into(),
            ));
        }

        Ok(Self {
            info: RwLock::new(PeerInfo {
                address,
                public_key: def.public_key,
                urls: def.urls,
                apps: def.apps,
                connected_at: None,
            }),
            session: RwLock::new(None),
        })
    }

    /// Wrap an existing session. The session url is not recorded since an
    /// inbound stream's source address is usually not dialable.
    pub fn with_session(session: Arc<Session>) -> Self {
        let peer = Self::default();
        *peer.session.write() = Some(session);
        peer
    }

    pub fn address(&self) -> Option<Address> {
        self.info.read().address.clone()
    }

    pub fn public_key(&self) -> Option<String> {
        self.info.read().public_key.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.info.read().urls.clone()
    }

    pub fn apps(&self) -> Vec<String> {
        self.info.read().apps.clone()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.info.read().connected_at
    }

    pub fn runs_app(&self, name: &str) -> bool {
        self.info.read().apps.iter().any(|app| app == name)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.read().as_ref().map(|s| s.id())
    }

    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    /// Whether a session exists and has finished its handshake.
    pub fn connected(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|s| s.is_established())
    }

    /// Whether the local side dialed this peer. `None` without a session.
    pub fn initiate(&self) -> Option<bool> {
        self.session.read().as_ref().map(|s| s.initiate())
    }

    /// Attach a freshly dialed session. Fails if one is already attached.
    pub fn attach(&self, session: Arc<Session>) -> Result<()> {
        let mut slot = self.session.write();
        if slot.is_some() {
            return Err(NetworkError::Protocol("Peer already has a session".into()));
        }
        *slot = Some(session);
        Ok(())
    }

    /// Run the session handshake and adopt the remote's advertisement.
    pub async fn handshake(&self, advertisement: &Advertisement) -> Result<Advertisement> {
        let session = self
            .session()
            .ok_or_else(|| NetworkError::NotConnected("peer has no session".into()))?;
        let remote = session.handshake(advertisement).await?;

        let mut info = self.info.write();
        if let Some(expected) = &info.address {
            if expected != &remote.address {
                return Err(NetworkError::Verification(format!(
                    "Expected peer {expected}, handshake answered as {}",
                    remote.address
                )));
            }
        }
        info.address = Some(remote.address.clone());
        info.public_key = Some(remote.public_key.clone());
        for url in &remote.urls {
            if !info.urls.contains(url) {
                info.urls.push(url.clone());
            }
        }
        info.apps = remote.apps.clone();
        info.connected_at = Some(Utc::now());
        Ok(remote)
    }

    pub async fn send(&self, app: &str, command: &str, payload: &serde_json::Value) -> Result<()> {
        let session = match self.session() {
            Some(session) if session.is_established() => session,
            _ => {
                return Err(NetworkError::NotConnected(format!(
                    "peer {} is not connected",
                    self.describe()
                )));
            }
        };
        session.write(app, command, payload).await
    }

    /// End and detach the session, if any.
    pub async fn disconnect(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            debug!("Disconnecting peer {}", self.describe());
            session.end().await;
        }
        self.info.write().connected_at = None;
    }

    pub fn dump(&self) -> PeerDefinition {
        let info = self.info.read();
        PeerDefinition {
            address: info.address.clone(),
            public_key: info.public_key.clone(),
            urls: info.urls.clone(),
            apps: info.apps.clone(),
        }
    }

    fn describe(&self) -> String {
        let info = self.info.read();
        match (&info.address, info.urls.first()) {
            (Some(address), _) => address.to_string(),
            (None, Some(url)) => url.clone(),
            (None, None) => "<unknown>".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
