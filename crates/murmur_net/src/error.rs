//! Network error types.

use std::time::Duration;

/// Errors that can occur in the murmur_net crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// None of a peer's candidate urls could be dialed.
    #[error("Dial error: {0}")]
    Dial(String),

    /// A handshake or lookup did not complete in time.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A signature or address binding did not check out.
    #[error("Verification failed: {0}")]
    Verification(String),

    /// The session is absent, closed, or the swarm is not running.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Key material or ciphertext is malformed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A wire record could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No peer with this address is known or discoverable.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The key storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration or definition.
    #[error("Config error: {0}")]
    Config(String),

    /// An application handler reported a failure.
    #[error("App error: {0}")]
    App(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error is [`NetworkError::NotConnected`].
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected(_))
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = NetworkError> = std::result::Result<T, E>;
