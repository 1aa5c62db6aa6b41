//! Swarm — top-level coordinator for a murmur node.
//!
//! [`Swarm`] owns the node identity, its channels, discovery methods, apps and
//! the table of connected peers. It:
//! - accepts inbound streams from every channel and runs passive handshakes
//! - dials boot peers and queued peers on start
//! - routes inbound records to apps and publishes [`SwarmEvent`]s
//! - resolves unknown addresses through discovery before sending
//!
//! `Swarm` is a cheap handle; clones share the same node.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::{join_all, select_ok};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::app::registry::{AppRegistry, Dispatch};
use crate::app::{App, AppContext, AppMessage};
use crate::channel::{Channel, ChannelKind, IncomingStream, url_scheme};
use crate::config::SwarmConfig;
use crate::discovery::{Discovery, DiscoveryConfig, DiscoveryKind};
use crate::error::{NetworkError, Result};
use crate::identity::{Address, Identity};
use crate::peer::{Peer, PeerDefinition};
use crate::session::{InboundMessage, Session, SessionEvent};
use crate::storage::{PRIVATE_KEY, Storage};
use crate::wire::Advertisement;

const EVENT_CAPACITY: usize = 256;
const SESSION_EVENT_CAPACITY: usize = 256;
const INCOMING_CAPACITY: usize = 64;

/// Notifications published to [`Swarm::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    Connected(PeerDefinition),
    Disconnected(Address),
    Message(InboundMessage),
}

/// Everything [`Swarm::add`] knows how to connect to.
#[derive(Debug)]
pub enum PeerSource {
    Url(String),
    Definition(PeerDefinition),
    Existing(Peer),
    Inbound(Session),
}

impl From<&str> for PeerSource {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for PeerSource {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<PeerDefinition> for PeerSource {
    fn from(def: PeerDefinition) -> Self {
        Self::Definition(def)
    }
}

impl From<Peer> for PeerSource {
    fn from(peer: Peer) -> Self {
        Self::Existing(peer)
    }
}

/// Background machinery alive between `start` and `stop`.
struct Runtime {
    shutdown: broadcast::Sender<()>,
    session_tx: mpsc::Sender<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct SwarmInner {
    config: SwarmConfig,
    storage: Arc<dyn Storage>,
    identity: RwLock<Option<Arc<Identity>>>,
    channels: RwLock<HashMap<ChannelKind, Arc<dyn Channel>>>,
    discovery: RwLock<HashMap<DiscoveryKind, Arc<dyn Discovery>>>,
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    apps: Mutex<AppRegistry>,
    queued: Mutex<Vec<PeerSource>>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    runtime: Mutex<Option<Runtime>>,
    events: broadcast::Sender<SwarmEvent>,
}

/// A node in the overlay.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    /// Build a swarm from config. Channels and discovery methods named in the
    /// config are instantiated here; the node does nothing until [`start`](Self::start).
    pub fn new(config: SwarmConfig, storage: Arc<dyn Storage>) -> Self {
        let mut channels: HashMap<ChannelKind, Arc<dyn Channel>> = HashMap::new();
        for def in &config.channels {
            let channel: Arc<dyn Channel> = Arc::from(def.build());
            channels.insert(channel.kind(), channel);
        }

        let mut discovery: HashMap<DiscoveryKind, Arc<dyn Discovery>> = HashMap::new();
        for def in DiscoveryConfig::merge_boot(&config.boot_peers, &config.discovery) {
            let method: Arc<dyn Discovery> = Arc::from(def.build());
            discovery.insert(method.kind(), method);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SwarmInner {
                config,
                storage,
                identity: RwLock::new(None),
                channels: RwLock::new(channels),
                discovery: RwLock::new(discovery),
                peers: RwLock::new(HashMap::new()),
                apps: Mutex::new(AppRegistry::new()),
                queued: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                runtime: Mutex::new(None),
                events,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SwarmInner>) -> Self {
        Self { inner }
    }

    pub fn with_channel(self, channel: impl Channel + 'static) -> Self {
        let channel: Arc<dyn Channel> = Arc::new(channel);
        self.inner.channels.write().insert(channel.kind(), channel);
        self
    }

    pub fn with_discovery(self, method: impl Discovery + 'static) -> Self {
        self.add_discovery(Arc::new(method));
        self
    }

    pub fn with_app(self, app: impl App) -> Result<Self> {
        self.inner.apps.lock().register(Arc::new(app))?;
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The node address, while running.
    pub fn address(&self) -> Option<Address> {
        self.identity().map(|id| id.address().clone())
    }

    pub fn identity(&self) -> Option<Arc<Identity>> {
        self.inner.identity.read().clone()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn get_peer(&self, address: &Address) -> Option<Arc<Peer>> {
        self.inner.peers.read().get(address).cloned()
    }

    pub fn get_peer_definition(&self, address: &Address) -> Option<PeerDefinition> {
        self.get_peer(address).map(|peer| peer.dump())
    }

    pub fn app_names(&self) -> Vec<String> {
        self.inner.apps.lock().names()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Add or replace the channel of this kind. Brought up immediately when running.
    pub async fn add_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let previous = self
            .inner
            .channels
            .write()
            .insert(channel.kind(), Arc::clone(&channel));
        if let Some(previous) = previous {
            previous.down().await;
        }
        let shutdown = self
            .inner
            .runtime
            .lock()
            .as_ref()
            .map(|rt| rt.shutdown.clone());
        if let Some(shutdown) = shutdown {
            self.bring_up(channel, &shutdown).await?;
        }
        Ok(())
    }

    /// Add a discovery method, replacing any method of the same kind.
    pub fn add_discovery(&self, method: Arc<dyn Discovery>) {
        debug!("Adding {:?} discovery", method.kind());
        self.inner.discovery.write().insert(method.kind(), method);
    }

    pub fn remove_discovery(&self, kind: DiscoveryKind) {
        if self.inner.discovery.write().remove(&kind).is_some() {
            debug!("Removed {kind:?} discovery");
        }
    }

    pub fn discovery_kinds(&self) -> Vec<DiscoveryKind> {
        self.inner.discovery.read().keys().copied().collect()
    }

    /// Register an app. When running, its worker starts and `up` runs now.
    pub async fn register_app(&self, app: Arc<dyn App>) -> Result<()> {
        let name = app.name().to_string();
        self.inner.apps.lock().register(Arc::clone(&app))?;
        if self.is_running() {
            self.inner.apps.lock().spawn_worker(&name);
            self.start_app(app).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring the node online. A failure to load or create the identity is the
    /// only fatal error; channel, app and peer failures are logged.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let identity = self.bootstrap_identity().await?;
        *self.inner.identity.write() = Some(Arc::clone(&identity));

        let (shutdown, _) = broadcast::channel(1);
        let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let event_loop = tokio::spawn(event_loop(
            Arc::downgrade(&self.inner),
            session_rx,
            shutdown.subscribe(),
        ));
        *self.inner.runtime.lock() = Some(Runtime {
            shutdown: shutdown.clone(),
            session_tx,
            tasks: vec![event_loop],
        });
        self.inner.apps.lock().spawn_workers();
        self.inner.running.store(true, Ordering::Release);

        let channels: Vec<Arc<dyn Channel>> =
            self.inner.channels.read().values().cloned().collect();
        for channel in channels {
            if let Err(e) = self.bring_up(Arc::clone(&channel), &shutdown).await {
                error!("Failed to bring up {:?} channel: {e}", channel.kind());
            }
        }

        let apps = self.inner.apps.lock().apps();
        for app in apps {
            self.start_app(app).await;
        }

        info!(
            "Swarm started (address: {}, network: {:?})",
            identity.address(),
            self.inner.config.network_id
        );

        let mut sources: Vec<PeerSource> = self
            .discover()
            .await
            .into_iter()
            .map(PeerSource::Definition)
            .collect();
        sources.extend(std::mem::take(&mut *self.inner.queued.lock()));
        let results = join_all(sources.into_iter().map(|source| self.add(source))).await;
        for result in results {
            if let Err(e) = result {
                warn!("Failed to connect to peer on start: {e}");
            }
        }
        Ok(())
    }

    /// Take the node offline. The identity is cleared; a later `start`
    /// reloads it from storage.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let peers: Vec<(Address, Arc<Peer>)> = self.inner.peers.write().drain().collect();
        for (address, peer) in peers {
            peer.disconnect().await;
            let _ = self.inner.events.send(SwarmEvent::Disconnected(address));
        }

        let apps = self.inner.apps.lock().apps();
        for app in apps {
            if let Err(e) = app.down().await {
                warn!("App {:?} failed to stop: {e}", app.name());
            }
        }
        self.inner.apps.lock().stop_workers();

        let channels: Vec<Arc<dyn Channel>> =
            self.inner.channels.read().values().cloned().collect();
        for channel in channels {
            channel.down().await;
        }

        let runtime = self.inner.runtime.lock().take();
        if let Some(runtime) = runtime {
            let _ = runtime.shutdown.send(());
            drop(runtime.session_tx);
            for task in runtime.tasks {
                let _ = task.await;
            }
        }

        let identity = self.inner.identity.write().take();
        if let Some(identity) = identity {
            info!("Swarm {} stopped", identity.address());
        }
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Connect to a peer and add it to the table.
    ///
    /// Before `start`, the source is queued and `Ok(None)` is returned. A
    /// duplicate connection resolves to whichever peer survives the tiebreak.
    pub async fn add(&self, source: impl Into<PeerSource>) -> Result<Option<Arc<Peer>>> {
        let source = source.into();
        if !self.is_running() {
            if let PeerSource::Inbound(session) = source {
                session.end().await;
                return Err(NetworkError::NotConnected("swarm is not running".into()));
            }
            debug!("Swarm not running; queueing {source:?}");
            self.inner.queued.lock().push(source);
            return Ok(None);
        }

        let identity = self.running_identity()?;
        let peer = match source {
            PeerSource::Url(url) => Peer::from_url(url),
            PeerSource::Definition(def) => Peer::from_definition(def)?,
            PeerSource::Existing(peer) => peer,
            PeerSource::Inbound(session) => Peer::with_session(Arc::new(session)),
        };

        if let Some(address) = peer.address() {
            if &address == identity.address() {
                peer.disconnect().await;
                return Err(NetworkError::Config("refusing to connect to self".into()));
            }
            let existing = self.get_peer(&address).filter(|p| p.connected());
            if let Some(existing) = existing {
                if !peer.has_session() {
                    trace!("Already connected to {address}");
                    return Ok(Some(existing));
                }
            }
        }

        if !peer.has_session() {
            let session = self.dial(&peer.urls(), &identity).await?;
            peer.attach(Arc::new(session))?;
        }

        let advertisement = self.advertisement(&identity);
        if let Err(e) = peer.handshake(&advertisement).await {
            peer.disconnect().await;
            return Err(e);
        }
        let Some(address) = peer.address() else {
            peer.disconnect().await;
            return Err(NetworkError::Protocol("handshake left peer without address".into()));
        };
        if &address == identity.address() {
            debug!("Dropping connection to self");
            peer.disconnect().await;
            return Err(NetworkError::Config("refusing to connect to self".into()));
        }

        self.insert(address, Arc::new(peer), identity.address()).await
    }

    /// Send to the app on the peer at `address`, resolving it through
    /// discovery when it is not connected.
    pub async fn send(
        &self,
        address: &Address,
        app: &str,
        command: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(NetworkError::NotConnected("swarm is not running".into()));
        }

        let connected = self.get_peer(address).filter(|p| p.connected());
        let peer = match connected {
            Some(peer) => peer,
            None => {
                let def = self.lookup(address).await?;
                match self.add(PeerSource::Definition(def)).await {
                    Ok(Some(peer)) => peer,
                    Ok(None) => {
                        return Err(NetworkError::NotConnected("swarm is not running".into()));
                    }
                    Err(e) => {
                        self.forget(address);
                        return Err(e);
                    }
                }
            }
        };
        peer.send(app, command, payload).await
    }

    /// Tell every discovery method that `address` could not be reached.
    fn forget(&self, address: &Address) {
        let methods: Vec<Arc<dyn Discovery>> =
            self.inner.discovery.read().values().cloned().collect();
        for method in methods {
            method.forget(address);
        }
    }

    /// Send to every connected peer advertising `app`. Returns how many sends succeeded.
    pub async fn broadcast(&self, app: &str, command: &str, payload: &serde_json::Value) -> usize {
        let targets: Vec<Arc<Peer>> = self
            .peers()
            .into_iter()
            .filter(|peer| peer.connected() && peer.runs_app(app))
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|peer| async move { (peer, peer.send(app, command, payload).await) }),
        )
        .await;

        let mut sent = 0;
        for (peer, result) in results {
            match result {
                Ok(()) => sent += 1,
                Err(e) => warn!("Broadcast to {:?} failed: {e}", peer.address()),
            }
        }
        sent
    }

    /// Race every discovery method's lookup; the first success wins.
    async fn lookup(&self, address: &Address) -> Result<PeerDefinition> {
        let methods: Vec<Arc<dyn Discovery>> =
            self.inner.discovery.read().values().cloned().collect();
        if methods.is_empty() {
            return Err(NetworkError::PeerNotFound(format!(
                "{address} (no discovery methods)"
            )));
        }

        let lookups = methods.into_iter().map(|method| {
            let address = address.clone();
            async move { method.lookup(&address).await }.boxed()
        });
        match select_ok(lookups).await {
            Ok((def, _)) => Ok(def),
            Err(e) => Err(NetworkError::PeerNotFound(format!("{address}: {e}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn bootstrap_identity(&self) -> Result<Arc<Identity>> {
        let storage = &self.inner.storage;
        if storage.exists(PRIVATE_KEY).await? {
            let bytes = storage.read(PRIVATE_KEY).await?;
            let identity = Identity::load(&bytes)?;
            debug!("Loaded identity {}", identity.address());
            return Ok(Arc::new(identity));
        }

        let identity = Identity::generate();
        let bytes = identity
            .private_key_bytes()
            .ok_or_else(|| NetworkError::Crypto("generated identity has no private key".into()))?;
        storage.write(PRIVATE_KEY, &bytes).await?;
        info!("Generated new identity {}", identity.address());
        Ok(Arc::new(identity))
    }

    fn running_identity(&self) -> Result<Arc<Identity>> {
        self.identity()
            .ok_or_else(|| NetworkError::NotConnected("swarm is not running".into()))
    }

    fn session_sender(&self) -> Result<mpsc::Sender<SessionEvent>> {
        self.inner
            .runtime
            .lock()
            .as_ref()
            .map(|rt| rt.session_tx.clone())
            .ok_or_else(|| NetworkError::NotConnected("swarm is not running".into()))
    }

    async fn bring_up(
        &self,
        channel: Arc<dyn Channel>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<()> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        channel.up(incoming_tx).await?;
        let task = tokio::spawn(accept_streams(
            Arc::downgrade(&self.inner),
            incoming_rx,
            shutdown.subscribe(),
        ));
        if let Some(runtime) = self.inner.runtime.lock().as_mut() {
            runtime.tasks.push(task);
        }
        Ok(())
    }

    async fn start_app(&self, app: Arc<dyn App>) {
        let ctx = AppContext::new(app.name(), Arc::downgrade(&self.inner));
        match app.up(ctx).await {
            Ok(()) => debug!("App {:?} started", app.name()),
            Err(e) => error!("App {:?} failed to start: {e}", app.name()),
        }
    }

    async fn discover(&self) -> Vec<PeerDefinition> {
        let methods: Vec<Arc<dyn Discovery>> =
            self.inner.discovery.read().values().cloned().collect();
        let mut found = Vec::new();
        for method in methods {
            match method.discover().await {
                Ok(defs) => found.extend(defs),
                Err(e) => warn!("{:?} discovery failed: {e}", method.kind()),
            }
        }
        found
    }

    async fn dial(&self, urls: &[String], identity: &Arc<Identity>) -> Result<Session> {
        let events = self.session_sender()?;
        let mut failures = Vec::new();

        for url in urls {
            let channel = url_scheme(url).and_then(|scheme| {
                self.inner
                    .channels
                    .read()
                    .values()
                    .find(|c| c.kind().scheme() == scheme)
                    .cloned()
            });
            let Some(channel) = channel else {
                failures.push(format!("{url}: no channel for this scheme"));
                continue;
            };
            match channel.connect(url).await {
                Ok(stream) => {
                    debug!("Dialed {url}");
                    return Ok(Session::new(
                        url.clone(),
                        stream,
                        Arc::clone(identity),
                        true,
                        events,
                        self.inner.config.handshake_timeout,
                    ));
                }
                Err(e) => failures.push(format!("{url}: {e}")),
            }
        }

        if failures.is_empty() {
            return Err(NetworkError::Dial("peer has no urls".into()));
        }
        Err(NetworkError::Dial(failures.join("; ")))
    }

    async fn accept(&self, incoming: IncomingStream) {
        let identity = match self.running_identity() {
            Ok(identity) => identity,
            Err(_) => return,
        };
        let Ok(events) = self.session_sender() else {
            return;
        };
        let url = incoming.url.clone();
        let session = Session::new(
            incoming.url,
            incoming.stream,
            identity,
            false,
            events,
            self.inner.config.handshake_timeout,
        );
        if let Err(e) = self.add(PeerSource::Inbound(session)).await {
            warn!("Inbound connection from {url} rejected: {e}");
        }
    }

    fn advertisement(&self, identity: &Identity) -> Advertisement {
        let mut urls: Vec<String> = Vec::new();
        let channels: Vec<Arc<dyn Channel>> =
            self.inner.channels.read().values().cloned().collect();
        for channel in &channels {
            for ip in &self.inner.config.advertise_ips {
                let url = channel.format_url(ip);
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        Advertisement {
            address: identity.address().clone(),
            public_key: identity.public_key(),
            urls,
            apps: self.app_names(),
        }
    }

    /// Insert a handshaken peer, settling duplicate connections.
    async fn insert(
        &self,
        address: Address,
        peer: Arc<Peer>,
        own: &Address,
    ) -> Result<Option<Arc<Peer>>> {
        enum Outcome {
            Inserted,
            KeepExisting(Arc<Peer>),
            Replace(Arc<Peer>),
        }

        let outcome = {
            let mut peers = self.inner.peers.write();
            if !self.is_running() {
                None
            } else {
                let existing = peers.get(&address).cloned();
                Some(match existing {
                    None => {
                        peers.insert(address.clone(), Arc::clone(&peer));
                        Outcome::Inserted
                    }
                    Some(existing)
                        if existing.connected()
                            && !new_session_wins(&existing, &peer, own, &address) =>
                    {
                        Outcome::KeepExisting(existing)
                    }
                    Some(existing) => {
                        peers.remove(&address);
                        Outcome::Replace(existing)
                    }
                })
            }
        };

        match outcome {
            None => {
                peer.disconnect().await;
                return Err(NetworkError::NotConnected("swarm stopped".into()));
            }
            Some(Outcome::KeepExisting(existing)) => {
                debug!("Keeping existing session to {address}; closing duplicate");
                peer.disconnect().await;
                return Ok(Some(existing));
            }
            Some(Outcome::Replace(old)) => {
                debug!("Replacing session to {address}");
                old.disconnect().await;
                let inserted = {
                    let mut peers = self.inner.peers.write();
                    if self.is_running() && !peers.contains_key(&address) {
                        peers.insert(address.clone(), Arc::clone(&peer));
                        true
                    } else {
                        false
                    }
                };
                if !inserted {
                    peer.disconnect().await;
                    return Err(NetworkError::NotConnected(format!(
                        "lost race inserting {address}"
                    )));
                }
            }
            Some(Outcome::Inserted) => {}
        }

        let count = self.peer_count();
        if count > self.inner.config.max_peers {
            warn!(
                "Connected to {count} peers, above max_peers ({})",
                self.inner.config.max_peers
            );
        }
        info!(
            "Connected to {address} ({})",
            if peer.initiate() == Some(true) { "outbound" } else { "inbound" }
        );
        let _ = self.inner.events.send(SwarmEvent::Connected(peer.dump()));
        Ok(Some(peer))
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Message(message) => {
                let app_message = AppMessage {
                    address: message.address.clone(),
                    command: message.command.clone(),
                    payload: message.payload.clone(),
                };
                match self.inner.apps.lock().dispatch(&message.app, app_message) {
                    Dispatch::Queued => {}
                    Dispatch::UnknownApp => {
                        debug!("No app {:?} for message from {}", message.app, message.address);
                    }
                    Dispatch::NotRunning => {
                        debug!("App {:?} is not running; dropping message", message.app);
                    }
                    Dispatch::QueueFull => {
                        warn!("App {:?} queue is full; dropping message", message.app);
                    }
                }
                let _ = self.inner.events.send(SwarmEvent::Message(message));
            }
            SessionEvent::Closed {
                session_id,
                address,
            } => {
                let Some(address) = address else {
                    trace!("Session {session_id} closed before handshake");
                    return;
                };
                let removed = {
                    let mut peers = self.inner.peers.write();
                    let current = peers.get(&address).and_then(|p| p.session_id());
                    if current == Some(session_id) {
                        peers.remove(&address)
                    } else {
                        None
                    }
                };
                if let Some(peer) = removed {
                    peer.disconnect().await;
                    info!("Peer {address} disconnected");
                    let _ = self.inner.events.send(SwarmEvent::Disconnected(address));
                }
            }
        }
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("address", &self.address())
            .field("running", &self.is_running())
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Whether `new` should replace `existing` as the session to `remote`.
///
/// Both ends keep the session dialed by the lower of the two addresses.
fn new_session_wins(existing: &Peer, new: &Peer, own: &Address, remote: &Address) -> bool {
    let initiator = |peer: &Peer| match peer.initiate() {
        Some(true) => Some(own),
        Some(false) => Some(remote),
        None => None,
    };
    match (initiator(existing), initiator(new)) {
        (Some(kept_by), Some(offered_by)) => offered_by < kept_by,
        (None, Some(_)) => true,
        _ => false,
    }
}

async fn event_loop(
    inner: std::sync::Weak<SwarmInner>,
    mut session_rx: mpsc::Receiver<SessionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = session_rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = inner.upgrade() else { break };
                Swarm::from_inner(inner).handle_session_event(event).await;
            }
            _ = shutdown.recv() => {
                debug!("Swarm event loop shutting down");
                break;
            }
        }
    }
}

async fn accept_streams(
    inner: std::sync::Weak<SwarmInner>,
    mut incoming_rx: mpsc::Receiver<IncomingStream>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            incoming = incoming_rx.recv() => {
                let Some(incoming) = incoming else { break };
                let Some(inner) = inner.upgrade() else { break };
                let swarm = Swarm::from_inner(inner);
                debug!("Inbound stream from {}", incoming.url);
                tokio::spawn(async move { swarm.accept(incoming).await });
            }
            _ = shutdown.recv() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
