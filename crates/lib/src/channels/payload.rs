//! Payloads exchanged between a backend and its dispatcher.

use std::collections::HashMap;

/// Opaque conversation id within one backend (room, channel or chat id).
pub type Target = String;

/// Backend-specific send options (e.g. `avatar`, `parse_mode`).
pub type SendOptions = HashMap<String, String>;

/// A message received by a backend, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPayload {
    pub target: Target,
    pub username: Option<String>,
    pub text: String,
}

impl IncomingPayload {
    pub fn new(
        target: impl Into<Target>,
        username: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            username,
            text: text.into(),
        }
    }
}

/// A message to deliver, consumed exactly once by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPayload {
    pub target: Target,
    pub text: String,
    pub options: SendOptions,
}

impl OutgoingPayload {
    pub fn new(target: impl Into<Target>, text: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            text: text.into(),
            options: SendOptions::new(),
        }
    }

    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }
}
