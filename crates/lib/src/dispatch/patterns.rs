//! Ordered command patterns and generated help.

use crate::dispatch::conversation::Conversation;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Title used in help when no display name is configured.
pub const DEFAULT_DISPLAY_NAME: &str = "steward";

/// Patterns added when the orchestrator starts.
pub const HELP_PATTERN: &str = "help";
pub const SLASH_HELP_PATTERN: &str = "/help";

/// A command handler. Errors and panics are logged at the task boundary.
pub type Handler = Arc<dyn Fn(Conversation) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Conversation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |conversation| Box::pin(f(conversation)))
}

/// One registered command: text the message must start with, help text, handler.
#[derive(Clone)]
pub struct PatternEntry {
    pub pattern: String,
    pub help: String,
    pub handler: Handler,
}

impl std::fmt::Debug for PatternEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternEntry")
            .field("pattern", &self.pattern)
            .field("help", &self.help)
            .finish_non_exhaustive()
    }
}

/// Prefix every pattern must carry: `"<name> "` when named, else empty.
pub fn mapping_prefix(display_name: Option<&str>) -> String {
    match display_name {
        Some(name) if !name.trim().is_empty() => format!("{} ", name.trim()),
        _ => String::new(),
    }
}

/// Case-insensitive "text starts with prefix+pattern".
pub fn matches(prefix: &str, pattern: &str, text: &str) -> bool {
    strip_prefix_folded(text, &format!("{}{}", prefix, pattern)).is_some()
}

/// `text` without a leading `head`, comparing characters by their lowercase form.
pub fn strip_prefix_folded<'a>(text: &'a str, head: &str) -> Option<&'a str> {
    let needle: String = head.chars().flat_map(char::to_lowercase).collect();
    let mut rest = needle.as_str();
    for (i, c) in text.char_indices() {
        if rest.is_empty() {
            return Some(&text[i..]);
        }
        for lower in c.to_lowercase() {
            rest = rest.strip_prefix(lower)?;
        }
    }
    rest.is_empty().then_some("")
}

/// Commands in registration order. The first matching entry wins.
#[derive(Clone, Default, Debug)]
pub struct PatternRegistry {
    entries: Vec<PatternEntry>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, help: impl Into<String>, handler: Handler) {
        let pattern = pattern.into();
        let help = help.into();
        log::debug!("registering pattern '{}' ({})", pattern, help);
        self.entries.push(PatternEntry {
            pattern,
            help,
            handler,
        });
    }

    /// Copy every (pattern, help, handler) of `other` after the existing entries.
    pub fn import_from(&mut self, other: &PatternRegistry) {
        for entry in &other.entries {
            self.register(entry.pattern.clone(), entry.help.clone(), entry.handler.clone());
        }
    }

    pub fn entries(&self) -> &[PatternEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry whose `prefix+pattern` starts `text`.
    pub fn find(&self, prefix: &str, text: &str) -> Option<&PatternEntry> {
        self.entries
            .iter()
            .find(|e| matches(prefix, &e.pattern, text))
    }

    /// Render the help listing for the entries currently registered.
    pub fn render_help(
        &self,
        display_name: Option<&str>,
        abort_keywords: &[String],
    ) -> String {
        let prefix = mapping_prefix(display_name);
        let title = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_DISPLAY_NAME);
        let mut lines = vec![format!("{} at yor service:", title), String::new()];
        if !abort_keywords.is_empty() {
            lines.push(format!(
                "abort interactions with: {}",
                abort_keywords.join(", ")
            ));
        }
        lines.push("---".to_string());
        lines.extend(
            self.entries
                .iter()
                .map(|e| format!("{}{} - {}", prefix, e.pattern, e.help)),
        );
        lines.join("\n")
    }

    /// Freeze the registry for dispatch: appends the `help` and `/help` entries, both
    /// replying with the listing of the entries registered so far.
    pub fn with_help(mut self, display_name: Option<&str>, abort_keywords: &[String]) -> Self {
        let text = Arc::new(self.render_help(display_name, abort_keywords));
        for pattern in [HELP_PATTERN, SLASH_HELP_PATTERN] {
            let text = Arc::clone(&text);
            self.register(
                pattern,
                "show this help",
                handler(move |conversation| {
                    let text = Arc::clone(&text);
                    async move {
                        conversation.send(text.as_str()).await?;
                        Ok(())
                    }
                }),
            );
        }
        self
    }
}
