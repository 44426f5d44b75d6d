//! Rocket.Chat backend over the realtime websocket API.

pub mod protocol;
mod session;

pub use session::{
    Backoff, RocketChatBackend, Routed, SessionCore, SessionState, LOGIN_TIMEOUT,
    RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY, SUBSCRIPTION_REFRESH_INTERVAL,
};
