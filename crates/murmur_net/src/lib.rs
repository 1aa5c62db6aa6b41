//! Murmur Net — an authenticated, encrypted peer-to-peer overlay.
//!
//! Every node owns an Ed25519 key pair; its address is derived from the
//! public key, so a peer cannot claim an address it does not hold the key
//! for. Nodes talk over pluggable byte-stream channels using a line-based
//! record protocol: one plain handshake, then signed and encrypted records
//! multiplexed between named apps.
//!
//! # Architecture
//!
//! - **Identity**: key pair, address derivation, sign/verify, encrypt/decrypt.
//! - **Session**: handshake plus record framing over one stream.
//! - **Channels**: TCP (`tcp://host:port`) and in-process (`mem://name`).
//! - **Discovery**: boot urls and the `peer-lookup` broadcast query app.
//! - **Swarm**: peer table, routing to apps, lifecycle.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use murmur_net::{PeerLookup, Swarm, SwarmConfig, TcpChannel};
//! use murmur_net::storage::MemoryStorage;
//!
//! # async fn example() -> murmur_net::Result<()> {
//! let mut config = SwarmConfig::default();
//! config.boot_peers = vec!["tcp://10.0.0.1:1212".to_string()];
//!
//! let swarm = Swarm::new(config, Arc::new(MemoryStorage::new()))
//!     .with_channel(TcpChannel::default())
//!     .with_app(PeerLookup::new())?;
//!
//! swarm.start().await?;
//! // ... node is accepting connections and talking to peers ...
//! swarm.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod peer;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use app::{App, AppContext, AppMessage, PeerLookup};
pub use channel::{Channel, ChannelConfig, ChannelKind, MemoryChannel, MemoryNetwork, TcpChannel};
pub use config::SwarmConfig;
pub use discovery::{BootDiscovery, Discovery, DiscoveryConfig, DiscoveryKind};
pub use error::{NetworkError, Result};
pub use identity::{Address, Identity};
pub use peer::{Peer, PeerDefinition};
pub use session::{InboundMessage, Session, SessionState};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use swarm::{PeerSource, Swarm, SwarmEvent};
