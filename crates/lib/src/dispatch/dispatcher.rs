//! Per-backend dispatch loop: pending asks first, then the first matching pattern.

use crate::channels::{IncomingPayload, OutgoingPayload};
use crate::dispatch::conversation::{Conversation, DispatchLink};
use crate::dispatch::correlator::{AskCorrelator, Correlation};
use crate::dispatch::jobs::JobRegistry;
use crate::dispatch::patterns::{PatternEntry, PatternRegistry};
use crate::error::SendError;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pause before the loop continues after a failed iteration.
pub const LOOP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Reply sent to a target whose pending ask was aborted.
pub const ABORTED_TEXT: &str = "aborted";

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Consumed as the reply to a pending ask.
    Answered,
    /// Abort keyword: pending ask and running jobs cancelled.
    Aborted,
    /// A handler task was started for the pattern.
    Spawned(String),
    /// Nothing matched; dropped silently.
    Unmatched,
}

pub struct Dispatcher {
    prefix: String,
    registry: Arc<PatternRegistry>,
    link: DispatchLink,
    jobs: Arc<JobRegistry>,
    runtime: Handle,
}

impl Dispatcher {
    /// `shutdown` cancels the loop and every handler task spawned by it.
    pub fn new(
        backend_id: impl Into<String>,
        prefix: impl Into<String>,
        registry: Arc<PatternRegistry>,
        abort_keywords: Vec<String>,
        outbound: mpsc::Sender<OutgoingPayload>,
        runtime: Handle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            registry,
            link: DispatchLink {
                backend_id: backend_id.into(),
                outbound,
                correlator: Arc::new(AskCorrelator::new(abort_keywords)),
            },
            jobs: Arc::new(JobRegistry::new(shutdown)),
            runtime,
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.link.backend_id
    }

    pub fn correlator(&self) -> &Arc<AskCorrelator> {
        &self.link.correlator
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Drain `inbound` in arrival order until `shutdown` is cancelled or every sender is gone.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<IncomingPayload>,
        shutdown: CancellationToken,
    ) {
        log::info!(
            "dispatcher[{}]: started with {} pattern(s)",
            self.backend_id(),
            self.registry.len()
        );
        loop {
            let payload = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = inbound.recv() => match received {
                    Some(payload) => payload,
                    None => {
                        log::info!("dispatcher[{}]: inbound queue closed", self.backend_id());
                        break;
                    }
                },
            };
            if let Err(e) = self.handle(payload).await {
                log::warn!("dispatcher[{}]: {}", self.backend_id(), e);
                tokio::time::sleep(LOOP_RETRY_DELAY).await;
            }
        }
        self.link.correlator.clear();
        log::info!("dispatcher[{}]: stopped", self.backend_id());
    }

    /// Route one inbound message.
    pub async fn handle(&self, payload: IncomingPayload) -> Result<Dispatch, SendError> {
        log::debug!(
            "dispatcher[{}]: received '{}' from {:?} on {}",
            self.backend_id(),
            payload.text,
            payload.username,
            payload.target
        );
        match self.link.correlator.correlate(&payload.target, &payload.text) {
            Correlation::Answered => Ok(Dispatch::Answered),
            Correlation::Aborted(held) => {
                // The ask stays blocked until its jobs are cancelled.
                self.jobs.cancel(&payload.target);
                drop(held);
                self.link
                    .outbound
                    .send(OutgoingPayload::new(payload.target.clone(), ABORTED_TEXT))
                    .await
                    .map_err(|_| SendError {
                        target: payload.target.clone(),
                    })?;
                Ok(Dispatch::Aborted)
            }
            Correlation::NotPending => match self.registry.find(&self.prefix, &payload.text) {
                Some(entry) => {
                    let pattern = entry.pattern.clone();
                    self.spawn_handler(entry, payload);
                    Ok(Dispatch::Spawned(pattern))
                }
                None => {
                    log::trace!(
                        "dispatcher[{}]: nothing matches '{}' from {}",
                        self.backend_id(),
                        payload.text,
                        payload.target
                    );
                    Ok(Dispatch::Unmatched)
                }
            },
        }
    }

    fn spawn_handler(&self, entry: &PatternEntry, payload: IncomingPayload) {
        let (token, guard) = self.jobs.track(&payload.target);
        let target = payload.target.clone();
        let pattern = entry.pattern.clone();
        let backend_id = self.backend_id().to_string();
        let conversation = Conversation::new(
            payload.text,
            payload.target,
            payload.username,
            self.prefix.clone(),
            self.link.clone(),
        )
        .with_cancellation(token.clone());
        let handler = Arc::clone(&entry.handler);
        let run = AssertUnwindSafe(async move { handler(conversation).await }).catch_unwind();
        log::debug!("dispatcher[{}]: handling '{}' for {}", backend_id, pattern, target);
        self.runtime.spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::info!("dispatcher[{}]: '{}' for {} cancelled", backend_id, pattern, target);
                }
                outcome = run => match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::warn!("dispatcher[{}]: '{}' for {} failed: {:#}", backend_id, pattern, target, e);
                    }
                    Err(_) => {
                        log::warn!("dispatcher[{}]: '{}' for {} panicked", backend_id, pattern, target);
                    }
                },
            }
        });
    }
}
