//! In-process backend: a client handle plays the chat service. Used by the console
//! command and by tests.

use crate::channels::registry::{BackendPorts, ChatBackend, QUEUE_DEPTH};
use crate::channels::{IncomingPayload, OutgoingPayload};
use crate::error::{BackendError, SendError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The service side of a loopback pair; becomes a backend once it gets its ports.
pub struct LoopbackTransport {
    id: String,
    from_client: mpsc::Receiver<IncomingPayload>,
    to_client: mpsc::Sender<OutgoingPayload>,
}

/// The user side of a loopback pair.
pub struct LoopbackClient {
    to_backend: mpsc::Sender<IncomingPayload>,
    replies: mpsc::Receiver<OutgoingPayload>,
}

/// Create a connected transport/client pair for backend `id`.
pub fn loopback(id: impl Into<String>) -> (LoopbackTransport, LoopbackClient) {
    let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
    (
        LoopbackTransport {
            id: id.into(),
            from_client: in_rx,
            to_client: out_tx,
        },
        LoopbackClient {
            to_backend: in_tx,
            replies: out_rx,
        },
    )
}

impl LoopbackTransport {
    pub fn into_backend(self, ports: BackendPorts) -> LoopbackBackend {
        LoopbackBackend {
            id: self.id,
            wiring: Mutex::new(Some(Wiring {
                from_client: self.from_client,
                to_client: self.to_client,
                ports_inbound: ports.inbound,
                ports_outbound: ports.outbound,
            })),
            runtime: ports.runtime,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }
}

impl LoopbackClient {
    /// Deliver a message as if `username` wrote `text` in `target`.
    pub async fn say(
        &self,
        target: &str,
        username: Option<&str>,
        text: &str,
    ) -> Result<(), SendError> {
        self.to_backend
            .send(IncomingPayload::new(
                target,
                username.map(str::to_string),
                text,
            ))
            .await
            .map_err(|_| SendError {
                target: target.to_string(),
            })
    }

    /// Next reply from the bot; `None` once the backend is gone.
    pub async fn next_reply(&mut self) -> Option<OutgoingPayload> {
        self.replies.recv().await
    }

    /// Next reply, or `None` if nothing arrives within `wait`.
    pub async fn next_reply_within(&mut self, wait: Duration) -> Option<OutgoingPayload> {
        tokio::time::timeout(wait, self.replies.recv())
            .await
            .ok()
            .flatten()
    }
}

struct Wiring {
    from_client: mpsc::Receiver<IncomingPayload>,
    to_client: mpsc::Sender<OutgoingPayload>,
    ports_inbound: mpsc::Sender<IncomingPayload>,
    ports_outbound: mpsc::Receiver<OutgoingPayload>,
}

pub struct LoopbackBackend {
    id: String,
    wiring: Mutex<Option<Wiring>>,
    runtime: Handle,
    stop: CancellationToken,
    started: AtomicBool,
}

#[async_trait]
impl ChatBackend for LoopbackBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), BackendError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let wiring = self
            .wiring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| BackendError::Failed(self.id.clone(), "already wired".to_string()))?;
        self.runtime.spawn(forward(
            wiring.from_client,
            wiring.ports_inbound,
            self.stop.clone(),
        ));
        self.runtime.spawn(forward(
            wiring.ports_outbound,
            wiring.to_client,
            self.stop.clone(),
        ));
        log::debug!("loopback {}: started", self.id);
        Ok(())
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

async fn forward<T: Send + 'static>(
    mut from: mpsc::Receiver<T>,
    to: mpsc::Sender<T>,
    stop: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            item = from.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        if to.send(item).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::queue_pair;

    #[tokio::test]
    async fn bridges_both_directions_after_start() {
        let (transport, mut client) = loopback("loop");
        let (ports, mut dispatcher) = queue_pair(Handle::current());
        let backend = transport.into_backend(ports);
        backend.start().await.expect("start");
        backend.start().await.expect("second start is a no-op");

        client.say("room", Some("alice"), "hi").await.expect("say");
        let incoming = dispatcher.inbound.recv().await.expect("incoming");
        assert_eq!(incoming, IncomingPayload::new("room", Some("alice".into()), "hi"));

        dispatcher
            .outbound
            .send(OutgoingPayload::new("room", "hello"))
            .await
            .expect("send");
        let reply = client.next_reply().await.expect("reply");
        assert_eq!(reply.text, "hello");
    }

    #[tokio::test]
    async fn stop_ends_the_bridge() {
        let (transport, mut client) = loopback("loop");
        let (ports, _dispatcher) = queue_pair(Handle::current());
        let backend = transport.into_backend(ports);
        backend.start().await.expect("start");
        backend.stop();
        assert_eq!(client.next_reply().await, None);
    }
}
