//! Rocket.Chat realtime session: connect, login, subscribe, steady state, reconnect.
//!
//! Every attempt gets a fresh [`SessionCore`], so correlation state and the subscribed
//! room set never survive a reconnect. Attempt tasks (reader, writer, subscription
//! refresh, outgoing pump) share one cancellation token that ends them together.

use crate::channels::registry::{BackendPorts, ChatBackend};
use crate::channels::rocketchat::protocol::{
    self, classify, classify_login, subscription_room_ids, Frame,
};
use crate::channels::{IncomingPayload, OutgoingPayload};
use crate::config::{resolve_rocketchat_password, RocketChatConfig};
use crate::error::{AuthFailure, BackendError, SessionError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const SUBSCRIPTION_REFRESH_INTERVAL: Duration = Duration::from_secs(2);
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_QUEUE_DEPTH: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Subscribing,
    Ready,
    Stopped,
}

/// Capped exponential reconnect delay: 5s, 10s, 20s, 40s, 60s, 60s, ...
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// What the reader did with one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Send this frame back (pong).
    Reply(Value),
    /// Completed the correlated call with this id.
    Completed(String),
    /// Completed the id-less call.
    Acknowledged,
    /// Messages to forward to the dispatcher.
    Incoming(Vec<IncomingPayload>),
    Dropped,
}

/// Per-attempt protocol state: correlated calls, the id-less slot, subscribed rooms.
pub struct SessionCore {
    username: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    no_id: Mutex<Option<oneshot::Sender<Value>>>,
    no_id_flight: tokio::sync::Mutex<()>,
    rooms: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionCore {
    /// `username` is the bot's own identity; its messages are never forwarded.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            no_id: Mutex::new(None),
            no_id_flight: tokio::sync::Mutex::new(()),
            rooms: Mutex::new(HashSet::new()),
        }
    }

    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn register(&self) -> (String, oneshot::Receiver<Value>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        (id, rx)
    }

    fn register_no_id(&self) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.no_id) = Some(tx);
        rx
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Record `room_ids` as subscribed; returns the ones not seen before, in order.
    pub fn admit_rooms(&self, room_ids: Vec<String>) -> Vec<String> {
        let mut rooms = lock(&self.rooms);
        room_ids
            .into_iter()
            .filter(|rid| rooms.insert(rid.clone()))
            .collect()
    }

    pub fn subscribed_rooms(&self) -> usize {
        lock(&self.rooms).len()
    }

    /// Fail every outstanding call and forget subscriptions.
    pub fn reset(&self) {
        lock(&self.pending).clear();
        lock(&self.no_id).take();
        lock(&self.rooms).clear();
    }

    /// Classify one text frame and settle any call it answers.
    pub fn route(&self, text: &str) -> Routed {
        let frame = match classify(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("rocketchat: discarding unparsable frame ({}): {}", e, text);
                return Routed::Dropped;
            }
        };
        match frame {
            Frame::Ping => Routed::Reply(protocol::pong_frame()),
            Frame::Reply { id, body } => match lock(&self.pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(body);
                    Routed::Completed(id)
                }
                None => {
                    log::debug!("rocketchat: reply for unknown id {}", id);
                    Routed::Dropped
                }
            },
            Frame::Ack(body) => match lock(&self.no_id).take() {
                Some(tx) => {
                    let _ = tx.send(body);
                    Routed::Acknowledged
                }
                None => {
                    log::debug!("rocketchat: unexpected acknowledgement: {}", body);
                    Routed::Dropped
                }
            },
            Frame::RoomMessages(messages) => {
                let incoming: Vec<IncomingPayload> = messages
                    .into_iter()
                    .filter(|m| {
                        let own = m.username.as_deref() == Some(self.username.as_str());
                        if own {
                            log::trace!("rocketchat: ignoring own message in {}", m.rid);
                        }
                        !own
                    })
                    .map(|m| m.into_payload())
                    .collect();
                if incoming.is_empty() {
                    Routed::Dropped
                } else {
                    Routed::Incoming(incoming)
                }
            }
            Frame::Other(raw) => {
                log::debug!("rocketchat: unhandled frame: {}", raw);
                Routed::Dropped
            }
        }
    }
}

/// Sending side of one attempt: the core plus the writer queue.
#[derive(Clone)]
struct SessionLink {
    core: Arc<SessionCore>,
    frames: mpsc::Sender<Message>,
}

impl SessionLink {
    async fn send_frame(&self, frame: Value) -> Result<(), SessionError> {
        log::trace!("rocketchat: -> {}", frame);
        self.frames
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Method call tagged with a fresh correlation id; waits for its reply.
    async fn call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        let (id, rx) = self.core.register();
        self.send_frame(protocol::method_frame(&id, method, params))
            .await?;
        let reply = rx.await.map_err(|_| SessionError::Closed)?;
        log::debug!("rocketchat: {} answered: {}", method, reply);
        Ok(reply)
    }

    /// Frame whose reply carries no id. One such exchange runs at a time.
    async fn call_no_id(&self, frame: Value) -> Result<Value, SessionError> {
        let _flight = self.core.no_id_flight.lock().await;
        let rx = self.core.register_no_id();
        self.send_frame(frame).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn refresh_subscriptions(&self) -> Result<usize, SessionError> {
        let reply = self.call("subscriptions/get", Value::Null).await?;
        let fresh = self.core.admit_rooms(subscription_room_ids(&reply));
        for rid in &fresh {
            let id = self.core.next_id();
            self.send_frame(protocol::subscribe_frame(&id, rid)).await?;
            log::info!("rocketchat: subscribed to room {}", rid);
        }
        Ok(fresh.len())
    }
}

struct Session {
    config: RocketChatConfig,
    password: String,
    inbound: mpsc::Sender<IncomingPayload>,
    outbound: Arc<tokio::sync::Mutex<mpsc::Receiver<OutgoingPayload>>>,
    runtime: Handle,
    state: watch::Sender<SessionState>,
    stop: CancellationToken,
    started: AtomicBool,
    backoff: Backoff,
}

/// Rocket.Chat backend driving the session state machine.
pub struct RocketChatBackend {
    session: Arc<Session>,
}

impl RocketChatBackend {
    pub fn new(config: RocketChatConfig, ports: BackendPorts) -> Result<Self, BackendError> {
        Self::with_backoff(config, ports, Backoff::default())
    }

    /// Backend whose reconnect delays follow `backoff` instead of the 5s..60s default.
    pub fn with_backoff(
        config: RocketChatConfig,
        ports: BackendPorts,
        backoff: Backoff,
    ) -> Result<Self, BackendError> {
        let password = resolve_rocketchat_password(&config).ok_or_else(|| {
            BackendError::Misconfigured("rocketchat".to_string(), "password".to_string())
        })?;
        let (state, _) = watch::channel(SessionState::Stopped);
        Ok(Self {
            session: Arc::new(Session {
                config,
                password,
                inbound: ports.inbound,
                outbound: Arc::new(tokio::sync::Mutex::new(ports.outbound)),
                runtime: ports.runtime,
                state,
                stop: CancellationToken::new(),
                started: AtomicBool::new(false),
                backoff,
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.session.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.session.state.subscribe()
    }
}

#[async_trait]
impl ChatBackend for RocketChatBackend {
    fn id(&self) -> &str {
        "rocketchat"
    }

    async fn start(&self) -> Result<(), BackendError> {
        if self.session.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!(
            "rocketchat: starting session to {}",
            self.session.config.websocket_target
        );
        let session = Arc::clone(&self.session);
        self.session.runtime.spawn(session.run());
        Ok(())
    }

    fn stop(&self) {
        self.session.stop.cancel();
    }
}

impl Session {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
        log::debug!("rocketchat: state {:?}", state);
    }

    /// Lifecycle: attempts forever until stopped, backing off between attempts.
    async fn run(self: Arc<Self>) {
        let mut backoff = self.backoff.clone();
        while !self.stop.is_cancelled() {
            let attempt = self.stop.child_token();
            let mut reached_ready = false;
            let outcome = tokio::select! {
                _ = self.stop.cancelled() => Ok(()),
                outcome = self.attempt(&attempt, &mut reached_ready) => outcome,
            };
            attempt.cancel();
            if self.stop.is_cancelled() {
                break;
            }
            match outcome {
                Ok(()) => log::info!("rocketchat: connection closed"),
                Err(SessionError::Authentication(e)) => {
                    log::error!("rocketchat: login as {} failed: {}", self.config.username, e)
                }
                Err(e) => log::warn!("rocketchat: session failed: {}", e),
            }
            if reached_ready {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            self.set_state(SessionState::Connecting);
            log::info!("rocketchat: reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(SessionState::Stopped);
        log::info!("rocketchat: session stopped");
    }

    async fn connect(&self) -> Result<Socket, SessionError> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.config.ignore_invalid_ca)
            .danger_accept_invalid_hostnames(!self.config.ssl_verify_hostname)
            .build()?;
        let (socket, _) = tokio_tungstenite::connect_async_tls_with_config(
            self.config.websocket_target.as_str(),
            None,
            false,
            Some(Connector::NativeTls(tls)),
        )
        .await?;
        Ok(socket)
    }

    /// One connection: returns when the transport closes or a step fails.
    async fn attempt(
        &self,
        token: &CancellationToken,
        reached_ready: &mut bool,
    ) -> Result<(), SessionError> {
        self.set_state(SessionState::Connecting);
        let (sink, stream) = self.connect().await?.split();
        let core = Arc::new(SessionCore::new(self.config.username.clone()));
        let (frames_tx, frames_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let link = SessionLink {
            core: Arc::clone(&core),
            frames: frames_tx,
        };
        self.runtime
            .spawn(write_frames(sink, frames_rx, token.clone()));
        let reader = self.runtime.spawn(read_frames(
            stream,
            Arc::clone(&core),
            link.frames.clone(),
            self.inbound.clone(),
            token.clone(),
        ));

        let ack = link.call_no_id(protocol::connect_frame()).await?;
        if let Err(e) = check_connect_ack(&ack) {
            token.cancel();
            return Err(e);
        }
        log::info!("rocketchat: connect answer: {}", ack);

        self.set_state(SessionState::Authenticating);
        let login = link.call(
            "login",
            protocol::login_params(&self.config.username, &self.password),
        );
        let reply = tokio::time::timeout(LOGIN_TIMEOUT, login)
            .await
            .map_err(|_| AuthFailure::NoResponse)??;
        if let Err(failure) = classify_login(&reply) {
            token.cancel();
            return Err(failure.into());
        }
        log::info!("rocketchat: logged in as {}", self.config.username);

        self.set_state(SessionState::Subscribing);
        link.refresh_subscriptions().await?;
        self.runtime
            .spawn(refresh_subscriptions(link.clone(), token.clone()));
        self.runtime.spawn(pump_outgoing(
            link,
            Arc::clone(&self.outbound),
            self.config.default_avatar.clone(),
            token.clone(),
        ));

        self.set_state(SessionState::Ready);
        *reached_ready = true;
        let _ = reader.await;
        Err(SessionError::Closed)
    }
}

/// The server answers `connect` with `connected`, or `failed` naming the versions it speaks.
fn check_connect_ack(ack: &Value) -> Result<(), SessionError> {
    match ack.get("msg").and_then(Value::as_str) {
        Some("failed") => Err(SessionError::ConnectRefused(
            ack.get("version")
                .map(Value::to_string)
                .unwrap_or_else(|| ack.to_string()),
        )),
        _ => Ok(()),
    }
}

async fn write_frames(
    mut sink: SplitSink<Socket, Message>,
    mut frames: mpsc::Receiver<Message>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        log::warn!("rocketchat: write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
    token.cancel();
}

async fn read_frames(
    mut stream: SplitStream<Socket>,
    core: Arc<SessionCore>,
    frames: mpsc::Sender<Message>,
    inbound: mpsc::Sender<IncomingPayload>,
    token: CancellationToken,
) {
    'read: loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                log::trace!("rocketchat: <- {}", text);
                match core.route(&text) {
                    Routed::Reply(frame) => {
                        if frames.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Routed::Incoming(payloads) => {
                        for payload in payloads {
                            if inbound.send(payload).await.is_err() {
                                log::debug!("rocketchat: inbound queue closed");
                                break 'read;
                            }
                        }
                    }
                    Routed::Completed(_) | Routed::Acknowledged | Routed::Dropped => {}
                }
            }
            Some(Ok(Message::Close(frame))) => {
                log::info!("rocketchat: server closed connection: {:?}", frame);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("rocketchat: read failed: {}", e);
                break;
            }
            None => break,
        }
    }
    core.reset();
    token.cancel();
}

async fn refresh_subscriptions(link: SessionLink, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(SUBSCRIPTION_REFRESH_INTERVAL) => {}
        }
        log::trace!("rocketchat: checking for new subscriptions");
        match link.refresh_subscriptions().await {
            Ok(_) => {}
            Err(SessionError::Closed) => break,
            Err(e) => log::warn!("rocketchat: subscription refresh failed: {}", e),
        }
    }
}

/// Deliver queued replies as `sendMessage` calls. Failures are logged, not retried.
async fn pump_outgoing(
    link: SessionLink,
    outbound: Arc<tokio::sync::Mutex<mpsc::Receiver<OutgoingPayload>>>,
    default_avatar: String,
    token: CancellationToken,
) {
    let mut outbound = outbound.lock().await;
    loop {
        let payload = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let emoji = payload
            .options
            .get("avatar")
            .cloned()
            .unwrap_or_else(|| default_avatar.clone());
        let id = link.core.next_id();
        let frame = protocol::send_message_frame(&id, &payload.target, &payload.text, &emoji);
        if let Err(e) = link.send_frame(frame).await {
            log::warn!(
                "rocketchat: dropping message to {}: {}",
                payload.target,
                e
            );
        }
    }
}
