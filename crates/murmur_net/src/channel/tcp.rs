//! TCP channel — `tcp://host:port`.

use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BoxedStream, Channel, ChannelKind, IncomingStream};
use crate::error::{NetworkError, Result};

pub const DEFAULT_PORT: u16 = 1212;
pub const DEFAULT_HOST: &str = "0.0.0.0";

pub(crate) fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

pub(crate) fn default_port() -> u16 {
    DEFAULT_PORT
}

struct Listening {
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Plain TCP transport. Port `0` binds an ephemeral port; see [`TcpChannel::local_addr`].
pub struct TcpChannel {
    host: String,
    port: u16,
    listening: Mutex<Option<Listening>>,
}

impl TcpChannel {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            listening: Mutex::new(None),
        }
    }

    /// Bound address while the channel is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().as_ref().map(|l| l.local_addr)
    }
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Some(listening) = self.listening.get_mut().take() {
            listening.task.abort();
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Tcp
    }

    async fn up(&self, incoming: mpsc::Sender<IncomingStream>) -> Result<()> {
        if self.listening.lock().is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP channel listening on {local_addr}");

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(accept_loop(listener, incoming, shutdown_rx));

        let previous = self.listening.lock().replace(Listening {
            local_addr,
            shutdown,
            task,
        });
        if let Some(previous) = previous {
            // Lost a race with a concurrent `up`; keep the newer listener.
            let _ = previous.shutdown.send(());
            previous.task.abort();
        }
        Ok(())
    }

    async fn down(&self) {
        let Some(listening) = self.listening.lock().take() else {
            return;
        };
        let _ = listening.shutdown.send(());
        let _ = listening.task.await;
        info!("TCP channel on {} stopped", listening.local_addr);
    }

    async fn connect(&self, url: &str) -> Result<BoxedStream> {
        let (host, port) = parse_tcp_url(url)?;
        debug!("Dialing {host}:{port}");
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| NetworkError::Dial(format!("Connect to {url} failed: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn format_url(&self, ip: &str) -> String {
        let port = self.local_addr().map_or(self.port, |addr| addr.port());
        if ip.contains(':') {
            format!("tcp://[{ip}]:{port}")
        } else {
            format!("tcp://{ip}:{port}")
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    incoming: mpsc::Sender<IncomingStream>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted TCP connection from {peer_addr}");
                        let _ = stream.set_nodelay(true);
                        let accepted = IncomingStream {
                            url: format!("tcp://{peer_addr}"),
                            stream: Box::new(stream),
                        };
                        if incoming.send(accepted).await.is_err() {
                            warn!("Inbound stream receiver dropped; stopping accept loop");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!("TCP accept loop shutting down");
                break;
            }
        }
    }
}

fn parse_tcp_url(raw: &str) -> Result<(String, u16)> {
    let parsed =
        url::Url::parse(raw).map_err(|e| NetworkError::Dial(format!("Bad url {raw:?}: {e}")))?;
    if parsed.scheme() != ChannelKind::Tcp.scheme() {
        return Err(NetworkError::Dial(format!("Not a tcp url: {raw}")));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| NetworkError::Dial(format!("Url has no host: {raw}")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, parsed.port().unwrap_or(DEFAULT_PORT)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
