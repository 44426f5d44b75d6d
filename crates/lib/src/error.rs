//! Error types shared across backends and the dispatcher.

use thiserror::Error;

/// Why a login attempt was rejected. Fatal for the current session attempt only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("user not found")]
    UserNotFound,
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("protocol error during login: {0}")]
    ProtocolError(String),
    #[error("no response to login")]
    NoResponse,
}

/// Failure of one persistent-socket session attempt.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("tls: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("server refused connect: {0}")]
    ConnectRefused(String),
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthFailure),
    #[error("connection closed")]
    Closed,
}

/// Failure to start or drive a backend adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend {0} is missing configuration: {1}")]
    Misconfigured(String, String),
    #[error("backend {0} failed: {1}")]
    Failed(String, String),
}

/// The queue to a backend is gone (backend stopped).
#[derive(Debug, Clone, Error)]
#[error("backend queue closed for target {target}")]
pub struct SendError {
    pub target: String,
}

/// Programmatic injection into a backend's inbound queue failed.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("orchestrator is not running")]
    NotRunning,
    #[error("inbound queue of backend {0} is closed")]
    Closed(String),
}
