//! Per-invocation context handed to a command handler.

use crate::channels::{OutgoingPayload, SendOptions, Target};
use crate::dispatch::ask::Ask;
use crate::dispatch::correlator::AskCorrelator;
use crate::dispatch::patterns::strip_prefix_folded;
use crate::error::SendError;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_WRONG_ANSWER_TEXT: &str = "incompatible answer!";
pub const DEFAULT_TIMEOUT_TEXT: &str = "timeout!";
pub const DEFAULT_GIVE_UP_TEXT: &str = "well, nevermind then";

/// What a conversation needs from its dispatcher: the reply queue and the ask map.
#[derive(Clone)]
pub struct DispatchLink {
    pub backend_id: String,
    pub outbound: mpsc::Sender<OutgoingPayload>,
    pub correlator: Arc<AskCorrelator>,
}

/// The conversation a matched command runs in.
///
/// `ask_timeout` and the retry notices can be changed by the handler before asking.
pub struct Conversation {
    raw_text: String,
    target: Target,
    username: Option<String>,
    prefix: String,
    link: DispatchLink,
    cancelled: CancellationToken,
    arguments: OnceLock<Vec<String>>,
    pub ask_timeout: Duration,
    pub wrong_answer_text: String,
    pub timeout_text: String,
    pub give_up_text: String,
}

impl Conversation {
    pub fn new(
        raw_text: impl Into<String>,
        target: impl Into<Target>,
        username: Option<String>,
        prefix: impl Into<String>,
        link: DispatchLink,
    ) -> Self {
        Self {
            raw_text: raw_text.into(),
            target: target.into(),
            username,
            prefix: prefix.into(),
            link,
            cancelled: CancellationToken::new(),
            arguments: OnceLock::new(),
            ask_timeout: DEFAULT_ASK_TIMEOUT,
            wrong_answer_text: DEFAULT_WRONG_ANSWER_TEXT.to_string(),
            timeout_text: DEFAULT_TIMEOUT_TEXT.to_string(),
            give_up_text: DEFAULT_GIVE_UP_TEXT.to_string(),
        }
    }

    /// Tie the conversation to a job: once `token` is cancelled nothing more is sent.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancelled = token;
        self
    }

    /// The full command text as received.
    pub fn text(&self) -> &str {
        &self.raw_text
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn backend_id(&self) -> &str {
        &self.link.backend_id
    }

    /// Whitespace-separated words after the name prefix; the pattern itself is the first.
    ///
    /// `"bot deploy web 3"` with prefix `"bot "` gives `["deploy", "web", "3"]`.
    pub fn arguments(&self) -> &[String] {
        self.arguments.get_or_init(|| {
            let text = self.raw_text.as_str();
            strip_prefix_folded(text, &self.prefix)
                .unwrap_or(text)
                .split_whitespace()
                .map(str::to_string)
                .collect()
        })
    }

    /// Send text to the counterpart. Empty text is skipped.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send_with(text, SendOptions::new()).await
    }

    pub async fn send_with(
        &self,
        text: impl Into<String>,
        options: SendOptions,
    ) -> Result<(), SendError> {
        if self.cancelled.is_cancelled() {
            log::debug!("conversation {}: cancelled, not sending", self.target);
            return Err(SendError {
                target: self.target.clone(),
            });
        }
        let text = text.into();
        if text.is_empty() {
            log::warn!("conversation {}: not sending empty text", self.target);
            return Ok(());
        }
        let payload = OutgoingPayload::new(self.target.clone(), text).with_options(options);
        self.link.outbound.send(payload).await.map_err(|_| {
            log::warn!("conversation {}: outbound queue closed", self.target);
            SendError {
                target: self.target.clone(),
            }
        })
    }

    /// Ask something and wait up to `ask_timeout` for the next message on this target.
    pub async fn ask(&self, text: impl Into<String>) -> Ask<String> {
        self.ask_with(text, SendOptions::new()).await
    }

    pub async fn ask_with(&self, text: impl Into<String>, options: SendOptions) -> Ask<String> {
        let pending = self.link.correlator.register(&self.target);
        if self.send_with(text, options).await.is_err() {
            return Ask::Timeout;
        }
        pending.wait(self.ask_timeout).await
    }

    /// Ask up to `retries + 1` times until an answer satisfies `predicate`.
    ///
    /// Sends `timeout_text` after a timeout and `wrong_answer_text` after a rejected
    /// answer; when every attempt fails, sends `give_up_text` and returns timeout.
    pub async fn ask_with_retry<P>(
        &self,
        retries: usize,
        text: &str,
        options: SendOptions,
        predicate: P,
    ) -> Ask<String>
    where
        P: Fn(&str) -> bool,
    {
        for attempt in 0..=retries {
            match self.ask_with(text, options.clone()).await {
                Ask::Answer(value) if predicate(&value) => return Ask::Answer(value),
                Ask::Answer(value) => {
                    log::debug!(
                        "conversation {}: attempt {} rejected answer '{}'",
                        self.target,
                        attempt + 1,
                        value
                    );
                    let _ = self.send(self.wrong_answer_text.as_str()).await;
                }
                Ask::Timeout => {
                    let _ = self.send(self.timeout_text.as_str()).await;
                }
            }
        }
        let _ = self.send(self.give_up_text.as_str()).await;
        Ask::Timeout
    }
}
