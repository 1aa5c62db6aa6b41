//! Peer lookup — resolve an address by asking connected peers.
//!
//! Commands:
//! - `q` (payload: address string): "do you know this address?" Answered
//!   directly with `a` when the address is in the local peer table. Queries
//!   are never forwarded.
//! - `a` (payload: peer definition): resolves a pending lookup. Unsolicited
//!   and late answers are ignored.
//!
//! A pending entry carries its deadline, so it expires even if the caller
//! that broadcast the query is cancelled. Resolved entries are dropped when
//! the swarm fails to reach them.
//!
//! While running, the app registers a [`Discovery`] of kind
//! [`DiscoveryKind::PeerLookup`] so the swarm can use it to reach peers it
//! is not connected to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{App, AppContext, AppMessage};
use crate::discovery::{Discovery, DiscoveryKind};
use crate::error::{NetworkError, Result};
use crate::identity::Address;
use crate::peer::{Peer, PeerDefinition};

pub const APP_NAME: &str = "peer-lookup";
pub const QUERY_COMMAND: &str = "q";
pub const ANSWER_COMMAND: &str = "a";
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

enum CacheEntry {
    Pending {
        tx: watch::Sender<Option<PeerDefinition>>,
        deadline: Instant,
    },
    Resolved(PeerDefinition),
}

struct LookupState {
    timeout: Duration,
    ctx: Mutex<Option<AppContext>>,
    cache: Mutex<HashMap<Address, CacheEntry>>,
    queries_sent: AtomicUsize,
}

impl LookupState {
    fn context(&self) -> Result<AppContext> {
        self.ctx
            .lock()
            .clone()
            .ok_or_else(|| NetworkError::NotConnected("peer lookup is not running".into()))
    }

    async fn lookup(&self, address: &Address) -> Result<PeerDefinition> {
        let ctx = self.context()?;
        if let Some(def) = ctx.peer_definition(address) {
            return Ok(def);
        }

        let now = Instant::now();
        let (mut rx, deadline, created) = {
            let mut cache = self.cache.lock();
            match cache.get(address) {
                Some(CacheEntry::Resolved(def)) => return Ok(def.clone()),
                Some(CacheEntry::Pending { tx, deadline }) if *deadline > now => {
                    (tx.subscribe(), *deadline, false)
                }
                // Missing, or left behind past its deadline by a cancelled caller.
                _ => {
                    let deadline = now + self.timeout;
                    let (tx, rx) = watch::channel(None);
                    cache.insert(address.clone(), CacheEntry::Pending { tx, deadline });
                    (rx, deadline, true)
                }
            }
        };

        if created {
            self.queries_sent.fetch_add(1, Ordering::Relaxed);
            let asked = ctx
                .broadcast(QUERY_COMMAND, &serde_json::json!(address))
                .await;
            debug!("Asked {asked} peers for {address}");
            if asked == 0 {
                self.drop_pending(address, deadline);
                return Err(NetworkError::PeerNotFound(format!(
                    "{address} (no peers to ask)"
                )));
            }
        } else {
            trace!("Joining in-flight lookup for {address}");
        }

        match tokio::time::timeout_at(deadline, self.wait(&mut rx)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Lookup for {address} timed out");
                self.drop_pending(address, deadline);
                Err(NetworkError::Timeout(self.timeout))
            }
        }
    }

    async fn wait(&self, rx: &mut watch::Receiver<Option<PeerDefinition>>) -> Result<PeerDefinition> {
        match rx.wait_for(Option::is_some).await {
            Ok(def) => def
                .clone()
                .ok_or_else(|| NetworkError::Protocol("empty lookup answer".into())),
            Err(_) if self.ctx.lock().is_none() => {
                Err(NetworkError::NotConnected("peer lookup stopped".into()))
            }
            Err(_) => Err(NetworkError::Timeout(self.timeout)),
        }
    }

    /// Remove the pending entry with this deadline, failing everyone waiting on it.
    fn drop_pending(&self, address: &Address, deadline: Instant) {
        let mut cache = self.cache.lock();
        if matches!(
            cache.get(address),
            Some(CacheEntry::Pending { deadline: d, .. }) if *d == deadline
        ) {
            cache.remove(address);
        }
    }

    fn forget(&self, address: &Address) {
        let mut cache = self.cache.lock();
        if matches!(cache.get(address), Some(CacheEntry::Resolved(_))) {
            debug!("Forgetting cached definition for {address}");
            cache.remove(address);
        }
    }

    async fn on_query(&self, message: &AppMessage) -> Result<()> {
        let wanted = message
            .payload
            .as_str()
            .ok_or_else(|| NetworkError::Protocol("lookup query payload must be a string".into()))
            .and_then(Address::parse)?;

        let ctx = self.context()?;
        let Some(def) = ctx.peer_definition(&wanted) else {
            trace!("{} asked for unknown {wanted}", message.address);
            return Ok(());
        };
        let answered = ctx
            .reply(&message.address, ANSWER_COMMAND, &serde_json::to_value(def)?)
            .await?;
        if answered {
            debug!("Answered {} about {wanted}", message.address);
        } else {
            trace!("{} left before we could answer about {wanted}", message.address);
        }
        Ok(())
    }

    fn on_answer(&self, message: &AppMessage) -> Result<()> {
        let def: PeerDefinition = serde_json::from_value(message.payload.clone())?;
        // Validates that any public key matches the claimed address.
        let Some(address) = Peer::from_definition(def.clone())?.address() else {
            return Err(NetworkError::Protocol("lookup answer has no address".into()));
        };

        let mut cache = self.cache.lock();
        match cache.get(&address) {
            Some(CacheEntry::Pending { tx, .. }) => {
                debug!("Resolved {address} via {}", message.address);
                tx.send_replace(Some(def.clone()));
                cache.insert(address, CacheEntry::Resolved(def));
            }
            _ => trace!("Ignoring unsolicited answer for {address}"),
        }
        Ok(())
    }
}

/// The `peer-lookup` app. Clones share one cache.
#[derive(Clone)]
pub struct PeerLookup {
    state: Arc<LookupState>,
}

impl PeerLookup {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_QUERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Arc::new(LookupState {
                timeout,
                ctx: Mutex::new(None),
                cache: Mutex::new(HashMap::new()),
                queries_sent: AtomicUsize::new(0),
            }),
        }
    }

    /// Resolve `address` through the local table, the cache, or a network query.
    pub async fn lookup(&self, address: &Address) -> Result<PeerDefinition> {
        self.state.lookup(address).await
    }

    /// Number of `q` broadcasts issued so far.
    pub fn queries_sent(&self) -> usize {
        self.state.queries_sent.load(Ordering::Relaxed)
    }

    /// A discovery handle sharing this app's cache.
    pub fn discovery(&self) -> Arc<dyn Discovery> {
        Arc::new(LookupDiscovery {
            state: Arc::clone(&self.state),
        })
    }
}

impl Default for PeerLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl App for PeerLookup {
    fn name(&self) -> &str {
        APP_NAME
    }

    async fn up(&self, ctx: AppContext) -> Result<()> {
        ctx.add_discovery(self.discovery());
        *self.state.ctx.lock() = Some(ctx);
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        let ctx = self.state.ctx.lock().take();
        if let Some(ctx) = ctx {
            ctx.remove_discovery(DiscoveryKind::PeerLookup);
        }
        self.state.cache.lock().clear();
        Ok(())
    }

    async fn on_message(&self, message: AppMessage) -> Result<()> {
        match message.command.as_str() {
            QUERY_COMMAND => self.state.on_query(&message).await,
            ANSWER_COMMAND => self.state.on_answer(&message),
            other => {
                trace!("Unknown peer-lookup command {other:?}");
                Ok(())
            }
        }
    }
}

struct LookupDiscovery {
    state: Arc<LookupState>,
}

#[async_trait]
impl Discovery for LookupDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::PeerLookup
    }

    async fn lookup(&self, address: &Address) -> Result<PeerDefinition> {
        self.state.lookup(address).await
    }

    fn forget(&self, address: &Address) {
        self.state.forget(address);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn answer_from(sender: &Identity, def: &PeerDefinition) -> AppMessage {
        AppMessage {
            address: sender.address().clone(),
            command: ANSWER_COMMAND.into(),
            payload: serde_json::to_value(def).unwrap(),
        }
    }

    fn definition(identity: &Identity) -> PeerDefinition {
        PeerDefinition {
            address: Some(identity.address().clone()),
            public_key: Some(identity.public_key()),
            urls: vec!["mem://target".into()],
            apps: vec![APP_NAME.into()],
        }
    }

    fn pending(tx: watch::Sender<Option<PeerDefinition>>) -> CacheEntry {
        CacheEntry::Pending {
            tx,
            deadline: Instant::now() + DEFAULT_QUERY_TIMEOUT,
        }
    }

    #[tokio::test]
    async fn test_lookup_requires_running_app() {
        let app = PeerLookup::new();
        let address = Identity::generate().address().clone();
        let err = app.lookup(&address).await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(app.queries_sent(), 0);
    }

    #[tokio::test]
    async fn test_answer_resolves_pending_waiters() {
        let app = PeerLookup::new();
        let target = Identity::generate();
        let address = target.address().clone();

        let (tx, mut rx) = watch::channel(None);
        app.state
            .cache
            .lock()
            .insert(address.clone(), pending(tx));

        let responder = Identity::generate();
        app.on_message(answer_from(&responder, &definition(&target)))
            .await
            .unwrap();

        let resolved = app.state.wait(&mut rx).await.unwrap();
        assert_eq!(resolved.address, Some(address.clone()));
        assert!(matches!(
            app.state.cache.lock().get(&address),
            Some(CacheEntry::Resolved(_))
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_answer_is_ignored() {
        let app = PeerLookup::new();
        let target = Identity::generate();
        app.on_message(answer_from(&Identity::generate(), &definition(&target)))
            .await
            .unwrap();
        assert!(app.state.cache.lock().is_empty());
    }

    #[tokio::test]
    async fn test_forged_answer_is_rejected() {
        let app = PeerLookup::new();
        let target = Identity::generate();
        let mut def = definition(&target);
        def.public_key = Some(Identity::generate().public_key());

        let result = app
            .on_message(answer_from(&Identity::generate(), &def))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_forget_drops_only_resolved_entries() {
        let app = PeerLookup::new();
        let resolved = Identity::generate();
        let waiting = Identity::generate().address().clone();
        let (tx, _rx) = watch::channel(None);
        {
            let mut cache = app.state.cache.lock();
            cache.insert(
                resolved.address().clone(),
                CacheEntry::Resolved(definition(&resolved)),
            );
            cache.insert(waiting.clone(), pending(tx));
        }

        let discovery = app.discovery();
        discovery.forget(resolved.address());
        discovery.forget(&waiting);

        let cache = app.state.cache.lock();
        assert!(!cache.contains_key(resolved.address()));
        assert!(cache.contains_key(&waiting));
    }

    #[test]
    fn test_drop_pending_matches_deadline() {
        let app = PeerLookup::new();
        let address = Identity::generate().address().clone();
        let (tx, _rx) = watch::channel(None);
        let deadline = Instant::now() + DEFAULT_QUERY_TIMEOUT;
        app.state
            .cache
            .lock()
            .insert(address.clone(), CacheEntry::Pending { tx, deadline });

        app.state
            .drop_pending(&address, deadline + Duration::from_millis(1));
        assert!(app.state.cache.lock().contains_key(&address));
        app.state.drop_pending(&address, deadline);
        assert!(app.state.cache.lock().is_empty());
    }

    #[tokio::test]
    async fn test_down_fails_waiters() {
        let app = PeerLookup::new();
        let address = Identity::generate().address().clone();
        let (tx, mut rx) = watch::channel(None);
        app.state
            .cache
            .lock()
            .insert(address, pending(tx));

        app.down().await.unwrap();
        let err = app.state.wait(&mut rx).await.unwrap_err();
        assert!(err.is_not_connected());
    }
}
