//! Outcome of a conversational exchange.

use std::fmt;

/// Result of asking the chat counterpart something: the reply, or nothing in time
/// (which includes an abort).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ask<T> {
    Answer(T),
    Timeout,
}

impl<T> Ask<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Ask::Timeout)
    }

    /// The answer, or `fallback` on timeout.
    pub fn unwrap_or(self, fallback: T) -> T {
        match self {
            Ask::Answer(value) => value,
            Ask::Timeout => fallback,
        }
    }

    /// Turn a timeout into an answer of `fallback`.
    pub fn or(self, fallback: T) -> Ask<T> {
        match self {
            Ask::Answer(value) => Ask::Answer(value),
            Ask::Timeout => Ask::Answer(fallback),
        }
    }

    pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Ask<R> {
        match self {
            Ask::Answer(value) => Ask::Answer(f(value)),
            Ask::Timeout => Ask::Timeout,
        }
    }

    /// True when there is an answer and it satisfies `predicate`.
    pub fn any(&self, predicate: impl FnOnce(&T) -> bool) -> bool {
        match self {
            Ask::Answer(value) => predicate(value),
            Ask::Timeout => false,
        }
    }

    pub fn answer(self) -> Option<T> {
        self.into()
    }
}

impl<T> From<Ask<T>> for Option<T> {
    fn from(ask: Ask<T>) -> Self {
        match ask {
            Ask::Answer(value) => Some(value),
            Ask::Timeout => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Ask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ask::Answer(value) => write!(f, "[Answer: {}]", value),
            Ask::Timeout => f.write_str("[Timeout]"),
        }
    }
}
