//! Chat backends (Rocket.Chat, Telegram, loopback).
//!
//! Each backend owns the platform connection and exchanges payloads with its
//! dispatcher over a pair of bounded queues.

mod loopback;
mod payload;
mod registry;
pub mod rocketchat;
mod telegram;

use crate::config::BackendConfig;
use crate::error::BackendError;
use std::sync::Arc;

pub use loopback::{loopback, LoopbackBackend, LoopbackClient, LoopbackTransport};
pub use payload::{IncomingPayload, OutgoingPayload, SendOptions, Target};
pub use registry::{
    queue_pair, BackendPorts, BackendRegistry, ChatBackend, DispatcherPorts, QUEUE_DEPTH,
};
pub use rocketchat::RocketChatBackend;
pub use telegram::{strip_bot_mention, TelegramBackend, TelegramUpdate};

/// Build the backend a config entry describes, wired to `ports`.
pub fn build_backend(
    config: &BackendConfig,
    ports: BackendPorts,
) -> Result<Arc<dyn ChatBackend>, BackendError> {
    Ok(match config {
        BackendConfig::RocketChat(rc) => Arc::new(RocketChatBackend::new(rc.clone(), ports)?),
        BackendConfig::Telegram(tg) => Arc::new(TelegramBackend::new(tg.clone(), ports)?),
    })
}
