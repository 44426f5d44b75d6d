//! Pending-reply correlation: at most one outstanding ask per target.
//!
//! A handler registers before sending its question; the dispatcher hands the next
//! inbound message on that target to the registered ask instead of pattern matching it.
//! Dropping the reply slot (abort, replacement, shutdown) makes the waiting ask observe
//! [`Ask::Timeout`].

use crate::channels::Target;
use crate::dispatch::ask::Ask;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

struct PendingAsk {
    ticket: u64,
    reply: oneshot::Sender<String>,
}

/// What the dispatcher did with an inbound message.
#[derive(Debug)]
pub enum Correlation {
    /// No ask was waiting; the message goes on to pattern matching.
    NotPending,
    /// The waiting ask received the message.
    Answered,
    /// The message was an abort keyword. The ask is already detached from the map;
    /// it observes timeout once the [`AbortedAsk`] is dropped.
    Aborted(AbortedAsk),
}

/// An ask taken out by an abort keyword, still blocked until this is dropped.
#[derive(Debug)]
pub struct AbortedAsk {
    _reply: oneshot::Sender<String>,
}

pub struct AskCorrelator {
    pending: Mutex<HashMap<Target, PendingAsk>>,
    abort_keywords: Vec<String>,
    next_ticket: AtomicU64,
}

/// A registered ask. Dropping it withdraws the registration if it is still current.
pub struct PendingReply {
    correlator: Arc<AskCorrelator>,
    target: Target,
    ticket: u64,
    rx: Option<oneshot::Receiver<String>>,
}

impl AskCorrelator {
    pub fn new(abort_keywords: Vec<String>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            abort_keywords,
            next_ticket: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Target, PendingAsk>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn abort_keywords(&self) -> &[String] {
        &self.abort_keywords
    }

    /// Exact, case-sensitive match of the whole (trimmed) text.
    pub fn is_abort_keyword(&self, text: &str) -> bool {
        let text = text.trim();
        self.abort_keywords.iter().any(|k| k == text)
    }

    /// Register the single pending ask for `target`. An ask already waiting on the
    /// target is orphaned and resolves to timeout immediately.
    pub fn register(self: &Arc<Self>, target: &str) -> PendingReply {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().insert(
            target.to_string(),
            PendingAsk {
                ticket,
                reply: tx,
            },
        );
        if previous.is_some() {
            log::warn!("ask on {} replaced an outstanding ask", target);
        }
        PendingReply {
            correlator: Arc::clone(self),
            target: target.to_string(),
            ticket,
            rx: Some(rx),
        }
    }

    /// Route an inbound message to the pending ask of its target, if any.
    ///
    /// The entry is removed under the map lock, so an abort always finds the ask that
    /// was pending when the message arrived, even if its handler is being cancelled.
    pub fn correlate(&self, target: &str, text: &str) -> Correlation {
        let Some(pending) = self.lock().remove(target) else {
            return Correlation::NotPending;
        };
        if self.is_abort_keyword(text) {
            log::info!("target {} received abort keyword: {}", target, text.trim());
            return Correlation::Aborted(AbortedAsk {
                _reply: pending.reply,
            });
        }
        match pending.reply.send(text.to_string()) {
            Ok(()) => Correlation::Answered,
            Err(_) => Correlation::NotPending,
        }
    }

    pub fn is_pending(&self, target: &str) -> bool {
        self.lock().contains_key(target)
    }

    /// Drop every pending ask; their callers observe timeout.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn withdraw(&self, target: &str, ticket: u64) {
        let mut g = self.lock();
        if g.get(target).is_some_and(|p| p.ticket == ticket) {
            g.remove(target);
        }
    }
}

impl PendingReply {
    /// Wait for the correlated reply or until `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Ask<String> {
        let Some(rx) = self.rx.take() else {
            return Ask::Timeout;
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(text)) => Ask::Answer(text),
            Ok(Err(_)) => Ask::Timeout,
            Err(_) => {
                log::debug!("ask on {} timed out after {:?}", self.target, timeout);
                Ask::Timeout
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.withdraw(&self.target, self.ticket);
    }
}
