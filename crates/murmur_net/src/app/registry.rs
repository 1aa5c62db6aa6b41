//! Routes inbound messages to per-app worker queues.
//!
//! Each registered app gets its own bounded queue and worker task while the
//! swarm runs, so a slow or blocked handler only stalls its own app. Handler
//! errors and panics are logged and the worker keeps going.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{App, AppMessage, validate_name};
use crate::error::{NetworkError, Result};

const QUEUE_CAPACITY: usize = 256;

/// Result of handing a message to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Queued,
    UnknownApp,
    NotRunning,
    QueueFull,
}

struct Worker {
    tx: mpsc::Sender<AppMessage>,
    task: JoinHandle<()>,
}

struct Entry {
    app: Arc<dyn App>,
    worker: Option<Worker>,
}

#[derive(Default)]
pub(crate) struct AppRegistry {
    entries: HashMap<String, Entry>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, app: Arc<dyn App>) -> Result<()> {
        let name = app.name().to_string();
        validate_name(&name)?;
        if self.entries.contains_key(&name) {
            return Err(NetworkError::Config(format!(
                "App {name:?} is already registered"
            )));
        }
        debug!("Registering app {name:?}");
        self.entries.insert(name, Entry { app, worker: None });
        Ok(())
    }

    /// Registered app names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn apps(&self) -> Vec<Arc<dyn App>> {
        let mut apps: Vec<_> = self.entries.values().map(|e| Arc::clone(&e.app)).collect();
        apps.sort_by(|a, b| a.name().cmp(b.name()));
        apps
    }

    /// Start a worker for `name` if it has none. Needs a tokio runtime.
    pub fn spawn_worker(&mut self, name: &str) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        if entry.worker.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(run_worker(Arc::clone(&entry.app), rx));
        entry.worker = Some(Worker { tx, task });
    }

    pub fn spawn_workers(&mut self) {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            self.spawn_worker(&name);
        }
    }

    /// Stop every worker. Queued messages are discarded.
    pub fn stop_workers(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(worker) = entry.worker.take() {
                worker.task.abort();
            }
        }
    }

    pub fn dispatch(&self, app: &str, message: AppMessage) -> Dispatch {
        let Some(entry) = self.entries.get(app) else {
            return Dispatch::UnknownApp;
        };
        let Some(worker) = &entry.worker else {
            return Dispatch::NotRunning;
        };
        match worker.tx.try_send(message) {
            Ok(()) => Dispatch::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Dispatch::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => Dispatch::NotRunning,
        }
    }
}

impl Drop for AppRegistry {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

async fn run_worker(app: Arc<dyn App>, mut rx: mpsc::Receiver<AppMessage>) {
    while let Some(message) = rx.recv().await {
        let command = message.command.clone();
        let from = message.address.clone();
        match AssertUnwindSafe(app.on_message(message)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("App {:?} failed on {command:?} from {from}: {e}", app.name());
            }
            Err(_) => {
                error!("App {:?} panicked on {command:?} from {from}", app.name());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
