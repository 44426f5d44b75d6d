//! Backend contract and registry of running backends by id.

use crate::channels::payload::{IncomingPayload, OutgoingPayload};
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, RwLock};

/// Depth of the inbound and outbound queues of every backend. Producers wait when full.
pub const QUEUE_DEPTH: usize = 10;

/// The backend's ends of its two queues, plus the runtime to spawn its tasks on.
pub struct BackendPorts {
    /// Where the backend writes messages as they arrive.
    pub inbound: mpsc::Sender<IncomingPayload>,
    /// What the backend drains to deliver replies.
    pub outbound: mpsc::Receiver<OutgoingPayload>,
    pub runtime: Handle,
}

/// The dispatcher's ends of a backend's queues.
pub struct DispatcherPorts {
    pub inbound: mpsc::Receiver<IncomingPayload>,
    pub outbound: mpsc::Sender<OutgoingPayload>,
}

/// Create the bounded queue pair joining one backend to one dispatcher.
pub fn queue_pair(runtime: Handle) -> (BackendPorts, DispatcherPorts) {
    let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
    (
        BackendPorts {
            inbound: in_tx,
            outbound: out_rx,
            runtime,
        },
        DispatcherPorts {
            inbound: in_rx,
            outbound: out_tx,
        },
    )
}

/// A platform adapter bridging a chat service to the payload queues.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend id (e.g. "rocketchat", "telegram").
    fn id(&self) -> &str;
    /// Begin all adapter I/O. Calling it again on a started backend is a no-op.
    async fn start(&self) -> Result<(), BackendError>;
    /// Cancel owned tasks and release the transport.
    fn stop(&self);
}

/// Registry of backend ids to running backends.
pub struct BackendRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChatBackend>>>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a backend; a previous backend with the same id is stopped.
    pub async fn register(&self, backend: Arc<dyn ChatBackend>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(backend.id().to_string(), backend) {
            log::info!("backend {} replaced, stopping the previous one", old.id());
            old.stop();
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChatBackend>> {
        let g = self.inner.read().await;
        g.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut ids: Vec<String> = g.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop and forget every backend.
    pub async fn stop_all(&self) {
        let mut g = self.inner.write().await;
        for (_, backend) in g.drain() {
            backend.stop();
        }
    }
}
