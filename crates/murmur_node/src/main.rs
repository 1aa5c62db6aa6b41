mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use murmur_net::{FileStorage, PeerLookup, Swarm, SwarmConfig, SwarmEvent, TcpChannel};

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `~/.murmur`
fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".murmur"))
}

/// First CLI argument, or `~/.murmur/config.json`.
fn config_path() -> Result<PathBuf> {
    match std::env::args_os().nth(1) {
        Some(arg) => Ok(PathBuf::from(arg)),
        None => Ok(base_dir()?.join("config.json")),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let base = base_dir()?;
    let _guard = logging::init_logging(&base.join("logs"), logging::DEFAULT_FILTER)?;

    let path = config_path()?;
    let config = SwarmConfig::load_or_default(&path);
    if !path.exists() {
        if let Err(e) = config.save_to_file(&path) {
            warn!("Could not write default config to {}: {e}", path.display());
        }
    }
    info!(
        "Starting murmur node (network {:?}, config {})",
        config.network_id,
        path.display()
    );

    let lookup = PeerLookup::with_timeout(config.lookup_timeout);
    let default_tcp = config.channels.is_empty();
    let mut swarm = Swarm::new(config, Arc::new(FileStorage::new(base.join("keys"))))
        .with_app(lookup)?;
    if default_tcp {
        swarm = swarm.with_channel(TcpChannel::default());
    }

    let mut events = swarm.subscribe();
    swarm.start().await?;
    if let Some(address) = swarm.address() {
        info!("Node address: {address}");
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SwarmEvent::Connected(def)) => {
                    info!("Peer connected: {:?} at {:?}", def.address, def.urls);
                }
                Ok(SwarmEvent::Disconnected(address)) => {
                    info!("Peer disconnected: {address}");
                }
                Ok(SwarmEvent::Message(message)) => {
                    info!(
                        "Message from {} for {}/{}",
                        message.address, message.app, message.command
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event log fell behind, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for ctrl-c: {e}");
                }
                info!("Shutting down");
                break;
            }
        }
    }

    swarm.stop().await;
    Ok(())
}
