//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.steward/config.json`) and environment.
//! Secrets (bot token, chat password, gateway token) can come from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Display name. When set, every command must start with `"<name> "`.
    #[serde(default)]
    pub name: Option<String>,

    /// Start backends as soon as the orchestrator is launched (default true).
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    /// Literal messages that abort a pending question.
    #[serde(default)]
    pub abort_keywords: Vec<String>,

    /// One entry per chat backend to connect.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Optional HTTP control plane.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_auto_start() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            auto_start: default_auto_start(),
            abort_keywords: Vec::new(),
            backends: Vec::new(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_abort_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.abort_keywords.push(keyword.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }
}

/// One chat backend; the variant selects the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    RocketChat(RocketChatConfig),
    Telegram(TelegramConfig),
}

impl BackendConfig {
    /// Backend id used for logging, injection and lookup.
    pub fn id(&self) -> &'static str {
        match self {
            BackendConfig::RocketChat(_) => "rocketchat",
            BackendConfig::Telegram(_) => "telegram",
        }
    }
}

/// Rocket.Chat realtime (websocket) backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RocketChatConfig {
    /// e.g. `wss://chat.example.org/websocket`
    pub websocket_target: String,
    pub username: String,
    /// Overridden by ROCKETCHAT_PASSWORD env when set.
    #[serde(default)]
    pub password: Option<String>,
    /// Accept certificates not signed by a trusted CA.
    #[serde(default)]
    pub ignore_invalid_ca: bool,
    #[serde(default = "default_verify_hostname")]
    pub ssl_verify_hostname: bool,
    /// Emoji avatar used for replies without an `avatar` option.
    #[serde(default = "default_avatar")]
    pub default_avatar: String,
}

fn default_verify_hostname() -> bool {
    true
}

fn default_avatar() -> String {
    ":tophat:".to_string()
}

impl RocketChatConfig {
    pub fn new(
        websocket_target: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            websocket_target: websocket_target.into(),
            username: username.into(),
            password: Some(password.into()),
            ignore_invalid_ca: false,
            ssl_verify_hostname: default_verify_hostname(),
            default_avatar: default_avatar(),
        }
    }
}

/// Telegram Bot API backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    #[serde(default)]
    pub token: Option<String>,
    /// Bot username; a trailing `@<username>` mention is stripped from commands.
    #[serde(default)]
    pub username: Option<String>,
}

/// Gateway bind, port and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Serve the HTTP control plane (default false).
    #[serde(default)]
    pub enabled: bool,

    /// Port (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Bearer token required by `POST /inject`. Overridden by STEWARD_GATEWAY_TOKEN env.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            token: None,
        }
    }
}

/// Trimmed, non-empty value of `name` from the environment.
fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the gateway token: env STEWARD_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &GatewayConfig) -> Option<String> {
    env_secret("STEWARD_GATEWAY_TOKEN").or_else(|| trimmed(config.token.as_ref()))
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &TelegramConfig) -> Option<String> {
    env_secret("TELEGRAM_BOT_TOKEN").or_else(|| trimmed(config.token.as_ref()))
}

/// Resolve the Rocket.Chat password: env ROCKETCHAT_PASSWORD overrides config.
pub fn resolve_rocketchat_password(config: &RocketChatConfig) -> Option<String> {
    env_secret("ROCKETCHAT_PASSWORD").or_else(|| trimmed(config.password.as_ref()))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("STEWARD_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".steward").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, else the default path. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
