//! Session — per-connection handshake and encrypted record protocol.
//!
//! A [`Session`] owns one byte stream. A background reader task deframes
//! inbound records, validates the remote handshake and verifies, decrypts and
//! forwards encrypted records as [`SessionEvent::Message`]. Writes go through
//! the write half behind an async mutex so records are never interleaved.
//!
//! Remote closes surface as [`SessionEvent::Closed`]. A local [`Session::end`]
//! tears the stream down without emitting an event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::channel::BoxedStream;
use crate::error::{NetworkError, Result};
use crate::identity::{Address, Identity};
use crate::wire::{self, Advertisement, LineFramer, Mode, Record};

/// Default bound on waiting for the remote advertisement.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on one record write. A remote that stops reading fails the write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 8 * 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

/// A verified, decrypted application record.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub address: Address,
    pub app: String,
    pub command: String,
    pub payload: serde_json::Value,
}

/// Events a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    Message(InboundMessage),
    Closed {
        session_id: Uuid,
        address: Option<Address>,
    },
}

struct Remote {
    identity: Arc<Identity>,
    advertisement: Advertisement,
}

struct Shared {
    id: Uuid,
    identity: Arc<Identity>,
    state: RwLock<SessionState>,
    remote: RwLock<Option<Remote>>,
    rejection: Mutex<Option<String>>,
    /// Flipped once on close; in-flight writes give up the writer when it does.
    closed: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
}

impl Shared {
    fn rejected(&self) -> Option<NetworkError> {
        self.rejection
            .lock()
            .as_ref()
            .map(|reason| NetworkError::Verification(reason.clone()))
    }

    fn remote_identity(&self) -> Option<Arc<Identity>> {
        self.remote.read().as_ref().map(|r| Arc::clone(&r.identity))
    }

    fn remote_address(&self) -> Option<Address> {
        self.remote.read().as_ref().map(|r| r.identity.address().clone())
    }

    async fn write_record(&self, record: &Record) -> Result<()> {
        let line = record.encode()?;
        let mut closed = self.closed.subscribe();
        let mut writer = tokio::select! {
            writer = self.writer.lock() => writer,
            _ = closed.wait_for(|closed| *closed) => {
                return Err(NetworkError::NotConnected("session closed".into()));
            }
        };
        let Some(stream) = writer.as_mut() else {
            return Err(NetworkError::NotConnected("session closed".into()));
        };

        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        };
        let result = tokio::select! {
            result = tokio::time::timeout(WRITE_TIMEOUT, write) => result,
            _ = closed.wait_for(|closed| *closed) => {
                return Err(NetworkError::NotConnected("session closed during write".into()));
            }
        };

        let err = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => NetworkError::Io(e),
            Err(_) => {
                warn!("Write stalled for {WRITE_TIMEOUT:?}; closing writer");
                NetworkError::Timeout(WRITE_TIMEOUT)
            }
        };
        *writer = None;
        *self.state.write() = SessionState::Closed;
        Err(err)
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        *self.state.write() = SessionState::Closed;
        self.remote.write().take();
        let stream = self.writer.lock().await.take();
        if let Some(mut stream) = stream {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await;
        }
    }

    /// Handle one inbound line. Returns `false` when the session must be torn down.
    async fn handle_line(
        &self,
        line: &[u8],
        events: &mpsc::Sender<SessionEvent>,
        handshake_tx: &mpsc::Sender<Advertisement>,
    ) -> bool {
        let Ok(line) = std::str::from_utf8(line) else {
            debug!("Dropping non-UTF-8 record");
            return true;
        };
        if line.is_empty() {
            return true;
        }
        let record = match Record::parse(line) {
            Ok(record) => record,
            Err(e) => {
                debug!("Dropping malformed record: {e}");
                return true;
            }
        };

        if record.is_handshake() {
            return self.accept_handshake(&record, handshake_tx);
        }

        if record.mode == Mode::Plain {
            debug!("Dropping plain record for app {:?}", record.app);
            return true;
        }

        match self.open_record(record) {
            Ok(Some(message)) => events.send(SessionEvent::Message(message)).await.is_ok(),
            Ok(None) => true,
            Err(e) => {
                debug!("Dropping encrypted record: {e}");
                true
            }
        }
    }

    fn accept_handshake(
        &self,
        record: &Record,
        handshake_tx: &mpsc::Sender<Advertisement>,
    ) -> bool {
        if self.remote.read().is_some() {
            trace!("Ignoring repeated handshake");
            return true;
        }

        let verified = Advertisement::decode(&record.payload).and_then(|advertisement| {
            let identity = Identity::from_public_key(&advertisement.public_key)?;
            if identity.address() != &advertisement.address
                || record.sender != advertisement.address.as_str()
            {
                return Err(NetworkError::Verification(format!(
                    "Claimed address {} does not match key-derived address {}",
                    advertisement.address,
                    identity.address()
                )));
            }
            Ok((identity, advertisement))
        });

        match verified {
            Ok((identity, advertisement)) => {
                debug!("Handshake from {} verified", advertisement.address);
                *self.remote.write() = Some(Remote {
                    identity: Arc::new(identity),
                    advertisement: advertisement.clone(),
                });
                *self.state.write() = SessionState::Established;
                let _ = handshake_tx.try_send(advertisement);
                true
            }
            Err(NetworkError::Verification(reason)) => {
                warn!("Rejecting session: {reason}");
                *self.rejection.lock() = Some(reason);
                false
            }
            Err(e) => {
                debug!("Dropping unreadable handshake: {e}");
                true
            }
        }
    }

    fn open_record(&self, record: Record) -> Result<Option<InboundMessage>> {
        let Some(remote) = self.remote_identity() else {
            trace!("Dropping record received before handshake");
            return Ok(None);
        };
        if record.sender != remote.address().as_str() {
            return Err(NetworkError::Verification(format!(
                "Sender {} does not match session peer {}",
                record.sender,
                remote.address()
            )));
        }

        let (ciphertext, signature) = wire::open(&record.payload)?;
        if !remote.verify(&ciphertext, &signature) {
            return Err(NetworkError::Verification("Bad record signature".into()));
        }
        let plaintext = self.identity.decrypt(&ciphertext)?;
        let payload = serde_json::from_slice(&plaintext)?;

        Ok(Some(InboundMessage {
            address: remote.address().clone(),
            app: record.app,
            command: record.command,
            payload,
        }))
    }
}

/// An authenticated, encrypted connection to one remote node.
pub struct Session {
    shared: Arc<Shared>,
    url: String,
    initiate: bool,
    handshake_timeout: Duration,
    advertised: AtomicBool,
    handshake_rx: tokio::sync::Mutex<mpsc::Receiver<Advertisement>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Wrap `stream` and start reading from it. Must be called inside a tokio runtime.
    pub fn new(
        url: impl Into<String>,
        stream: BoxedStream,
        identity: Arc<Identity>,
        initiate: bool,
        events: mpsc::Sender<SessionEvent>,
        handshake_timeout: Duration,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            identity,
            state: RwLock::new(SessionState::Connecting),
            remote: RwLock::new(None),
            rejection: Mutex::new(None),
            closed: watch::channel(false).0,
            writer: tokio::sync::Mutex::new(Some(write_half)),
        });

        let (handshake_tx, handshake_rx) = mpsc::channel(1);
        let reader = tokio::spawn(read_loop(
            Arc::clone(&shared),
            read_half,
            events,
            handshake_tx,
        ));

        Self {
            shared,
            url: url.into(),
            initiate,
            handshake_timeout,
            advertised: AtomicBool::new(false),
            handshake_rx: tokio::sync::Mutex::new(handshake_rx),
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether this side dialed the connection.
    pub fn initiate(&self) -> bool {
        self.initiate
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Address of the verified remote, once established.
    pub fn peer_address(&self) -> Option<Address> {
        self.shared.remote_address()
    }

    /// The remote's validated advertisement, once established.
    pub fn remote_advertisement(&self) -> Option<Advertisement> {
        if !self.is_established() {
            return None;
        }
        self.shared
            .remote
            .read()
            .as_ref()
            .map(|r| r.advertisement.clone())
    }

    /// Exchange advertisements and verify the remote's address binding.
    ///
    /// Returns the remote advertisement. Calling it again on an established
    /// session returns the stored advertisement without touching the stream.
    pub async fn handshake(&self, advertisement: &Advertisement) -> Result<Advertisement> {
        if self.advertised.load(Ordering::Acquire) {
            if let Some(remote) = self.remote_advertisement() {
                return Ok(remote);
            }
        }
        if let Some(e) = self.shared.rejected() {
            self.end().await;
            return Err(e);
        }
        if self.state() == SessionState::Closed {
            return Err(NetworkError::NotConnected("session closed".into()));
        }

        if !self.advertised.swap(true, Ordering::AcqRel) {
            {
                let mut state = self.shared.state.write();
                if *state == SessionState::Connecting {
                    *state = SessionState::Handshaking;
                }
            }
            debug!("Sending handshake advertisement on {}", self.url);
            let record = Record::handshake(self.shared.identity.address(), advertisement)?;
            if let Err(e) = self.shared.write_record(&record).await {
                self.end().await;
                return Err(self.shared.rejected().unwrap_or(e));
            }
        }

        let mut rx = self.handshake_rx.lock().await;
        if let Some(remote) = self.remote_advertisement() {
            return Ok(remote);
        }

        match tokio::time::timeout(self.handshake_timeout, rx.recv()).await {
            Ok(Some(remote)) => {
                debug!("Session {} established with {}", self.url, remote.address);
                Ok(remote)
            }
            Ok(None) => {
                drop(rx);
                self.end().await;
                Err(self.shared.rejected().unwrap_or_else(|| {
                    NetworkError::NotConnected("session closed during handshake".into())
                }))
            }
            Err(_) => {
                warn!("Handshake with {} timed out", self.url);
                drop(rx);
                self.end().await;
                Err(NetworkError::Timeout(self.handshake_timeout))
            }
        }
    }

    /// Encrypt, sign and send an application record.
    pub async fn write(&self, app: &str, command: &str, payload: &serde_json::Value) -> Result<()> {
        let remote = match self.shared.remote_identity() {
            Some(remote) if self.is_established() => remote,
            _ => {
                return Err(NetworkError::NotConnected(format!(
                    "session {} is not established",
                    self.url
                )));
            }
        };

        let plaintext = serde_json::to_vec(payload)?;
        let ciphertext = remote.encrypt(&plaintext)?;
        let signature = self.shared.identity.sign(&ciphertext)?;
        let record = Record::encrypted(
            self.shared.identity.address(),
            app,
            command,
            &ciphertext,
            &signature,
        );
        self.shared.write_record(&record).await
    }

    /// Close the stream. Safe to call more than once.
    pub async fn end(&self) {
        if let Some(reader) = self.reader.lock().take() {
            debug!("Ending session {}", self.url);
            reader.abort();
        }
        self.shared.close().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("url", &self.url)
            .field("initiate", &self.initiate)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<BoxedStream>,
    events: mpsc::Sender<SessionEvent>,
    handshake_tx: mpsc::Sender<Advertisement>,
) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Session read error: {e}");
                break;
            }
        };

        let lines = match framer.push(&buf[..n]) {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Closing session: {e}");
                break;
            }
        };

        for line in lines {
            if !shared.handle_line(&line, &events, &handshake_tx).await {
                break 'read;
            }
        }
    }

    let address = shared.remote_address();
    shared.close().await;
    debug!("Session {} closed (peer: {address:?})", shared.id);
    let _ = events
        .send(SessionEvent::Closed {
            session_id: shared.id,
            address,
        })
        .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
