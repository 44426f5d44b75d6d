//! Telegram backend: long-poll getUpdates and sendMessage via Bot API.

use crate::channels::registry::{BackendPorts, ChatBackend};
use crate::channels::{IncomingPayload, OutgoingPayload};
use crate::config::{resolve_telegram_token, TelegramConfig};
use crate::error::BackendError;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const POLL_ERROR_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    #[serde(default)]
    pub username: Option<String>,
}

/// Drop a `@<bot>` mention that directly follows the first word, as group chats
/// append it to commands (`/help@my_bot` -> `/help`).
pub fn strip_bot_mention(text: &str, bot_username: Option<&str>) -> String {
    let Some(bot) = bot_username.filter(|b| !b.is_empty()) else {
        return text.to_string();
    };
    let mention = format!("@{}", bot);
    let (head, rest) = match text.find(char::is_whitespace) {
        Some(i) => text.split_at(i),
        None => (text, ""),
    };
    match head.strip_suffix(mention.as_str()) {
        Some(stripped) => format!("{}{}", stripped, rest),
        None => text.to_string(),
    }
}

impl TelegramUpdate {
    /// Text messages become payloads; everything else is skipped.
    pub fn into_payload(self, bot_username: Option<&str>) -> Option<IncomingPayload> {
        let message = self.message?;
        let text = message.text?;
        Some(IncomingPayload::new(
            message.chat.id.to_string(),
            message.from.and_then(|u| u.username),
            strip_bot_mention(&text, bot_username),
        ))
    }
}

/// Resolve Telegram bot API base URL (for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}

struct TelegramApi {
    base: String,
    token: String,
    client: reqwest::Client,
}

impl TelegramApi {
    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let url = format!(
            "{}/bot{}/getUpdates?timeout={}",
            self.base, self.token, LONG_POLL_TIMEOUT
        );
        let url = if let Some(off) = offset {
            format!("{}&offset={}", url, off)
        } else {
            url
        };
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: GetUpdatesResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getUpdates returned ok: false".to_string());
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    /// Send a text message to a chat via sendMessage API.
    async fn send_message(&self, payload: &OutgoingPayload) -> Result<(), String> {
        let url = format!("{}/bot{}/sendMessage", self.base, self.token);
        let mut body = serde_json::json!({ "chat_id": payload.target, "text": payload.text });
        if let Some(mode) = payload.options.get("parse_mode") {
            body["parse_mode"] = serde_json::Value::String(mode.clone());
        }
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("sendMessage failed: {} {}", status, body));
        }
        Ok(())
    }
}

/// Telegram backend: long-polls for updates and delivers replies via sendMessage.
pub struct TelegramBackend {
    api: Arc<TelegramApi>,
    username: Option<String>,
    inbound: mpsc::Sender<IncomingPayload>,
    outbound: Mutex<Option<mpsc::Receiver<OutgoingPayload>>>,
    runtime: Handle,
    stop: CancellationToken,
    started: AtomicBool,
}

impl TelegramBackend {
    pub fn new(config: TelegramConfig, ports: BackendPorts) -> Result<Self, BackendError> {
        let token = resolve_telegram_token(&config).ok_or_else(|| {
            BackendError::Misconfigured("telegram".to_string(), "token".to_string())
        })?;
        Ok(Self {
            api: Arc::new(TelegramApi {
                base: telegram_api_base(),
                token,
                client: reqwest::Client::new(),
            }),
            username: config.username,
            inbound: ports.inbound,
            outbound: Mutex::new(Some(ports.outbound)),
            runtime: ports.runtime,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ChatBackend for TelegramBackend {
    fn id(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<(), BackendError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                BackendError::Failed("telegram".to_string(), "outbound queue taken".to_string())
            })?;
        log::info!("telegram: starting getUpdates long-poll loop");
        self.runtime.spawn(run_get_updates_loop(
            Arc::clone(&self.api),
            self.username.clone(),
            self.inbound.clone(),
            self.stop.clone(),
        ));
        self.runtime.spawn(pump_outgoing(
            Arc::clone(&self.api),
            outbound,
            self.stop.clone(),
        ));
        Ok(())
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

async fn run_get_updates_loop(
    api: Arc<TelegramApi>,
    username: Option<String>,
    inbound: mpsc::Sender<IncomingPayload>,
    stop: CancellationToken,
) {
    let mut offset: Option<i64> = None;
    loop {
        let polled = tokio::select! {
            _ = stop.cancelled() => break,
            polled = api.get_updates(offset) => polled,
        };
        match polled {
            Ok((updates, next)) => {
                offset = next.or(offset);
                for update in updates {
                    let Some(payload) = update.into_payload(username.as_deref()) else {
                        continue;
                    };
                    if inbound.send(payload).await.is_err() {
                        log::debug!("telegram: inbound queue closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(POLL_ERROR_DELAY) => {}
                }
            }
        }
    }
    log::info!("telegram: getUpdates loop stopped");
}

async fn pump_outgoing(
    api: Arc<TelegramApi>,
    mut outbound: mpsc::Receiver<OutgoingPayload>,
    stop: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        if let Err(e) = api.send_message(&payload).await {
            log::warn!("telegram: dropping message to {}: {}", payload.target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_bot_mention_from_command() {
        assert_eq!(strip_bot_mention("/help@my_bot", Some("my_bot")), "/help");
        assert_eq!(
            strip_bot_mention("echo@my_bot hello world", Some("my_bot")),
            "echo hello world"
        );
        assert_eq!(
            strip_bot_mention("mail me@my_bot", Some("my_bot")),
            "mail me@my_bot"
        );
        assert_eq!(strip_bot_mention("/help@other", Some("my_bot")), "/help@other");
        assert_eq!(strip_bot_mention("/help@my_bot", None), "/help@my_bot");
    }

    #[test]
    fn text_updates_become_payloads() {
        let update: TelegramUpdate = serde_json::from_str(
            r#"{"update_id":5,"message":{"chat":{"id":-42},"from":{"id":1,"username":"alice"},"text":"ping@bot"}}"#,
        )
        .expect("parse update");
        assert_eq!(
            update.into_payload(Some("bot")),
            Some(IncomingPayload::new("-42", Some("alice".to_string()), "ping"))
        );
        let sticker: TelegramUpdate =
            serde_json::from_str(r#"{"update_id":6,"message":{"chat":{"id":1}}}"#)
                .expect("parse update");
        assert_eq!(sticker.into_payload(None), None);
    }

    #[tokio::test]
    async fn missing_token_is_misconfiguration() {
        if std::env::var("TELEGRAM_BOT_TOKEN").is_ok() {
            return;
        }
        let (ports, _dispatcher) = crate::channels::queue_pair(Handle::current());
        let err = TelegramBackend::new(TelegramConfig::default(), ports)
            .err()
            .expect("no token");
        assert!(matches!(err, BackendError::Misconfigured(..)));
    }
}
