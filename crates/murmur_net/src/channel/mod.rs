//! Pluggable byte-stream transports.
//!
//! A channel listens for inbound streams (handed to the swarm over an mpsc
//! sender) and dials outbound urls of its scheme. Sessions run on top of
//! whatever stream a channel produces.

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::{MemoryChannel, MemoryNetwork};
pub use tcp::TcpChannel;

/// Any duplex byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An accepted inbound stream and the url it came from.
pub struct IncomingStream {
    pub url: String,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Transport families known to the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Tcp,
    Memory,
}

impl ChannelKind {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Memory => "mem",
        }
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Start listening. Inbound streams are sent to `incoming`.
    async fn up(&self, incoming: mpsc::Sender<IncomingStream>) -> Result<()>;

    /// Stop listening. Safe to call when already down.
    async fn down(&self);

    /// Dial a url of this channel's scheme.
    async fn connect(&self, url: &str) -> Result<BoxedStream>;

    /// The url other nodes should dial to reach this channel via `ip`.
    fn format_url(&self, ip: &str) -> String;
}

/// The scheme part of `scheme://rest`, if present.
pub fn url_scheme(url: &str) -> Option<&str> {
    url.split_once("://").map(|(scheme, _)| scheme)
}

/// Channel definitions accepted in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Tcp {
        #[serde(default = "tcp::default_host")]
        host: String,
        #[serde(default = "tcp::default_port")]
        port: u16,
    },
}

impl ChannelConfig {
    pub fn build(&self) -> Box<dyn Channel> {
        match self {
            Self::Tcp { host, port } => Box::new(TcpChannel::new(host.clone(), *port)),
        }
    }
}
