//! Handler tasks tracked per target for abort-by-keyword cancellation.
//!
//! Each target has at most one tracked entry: a cancellation scope shared by every
//! handler invocation currently running on that target. A new invocation joins the
//! existing scope, so an earlier invocation never becomes unreachable. The entry is
//! removed when its last invocation finishes or when it is cancelled.

use crate::channels::Target;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct TrackedJob {
    generation: u64,
    token: CancellationToken,
    live: usize,
}

pub struct JobRegistry {
    root: CancellationToken,
    jobs: Mutex<HashMap<Target, TrackedJob>>,
    next_generation: AtomicU64,
}

/// Membership of one handler invocation in its target's scope; released on drop.
pub struct JobGuard {
    registry: Arc<JobRegistry>,
    target: Target,
    generation: u64,
}

impl JobRegistry {
    /// `root` cancels every tracked job when cancelled (orchestrator shutdown).
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            jobs: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Target, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new invocation on `target`; returns the token it must observe.
    pub fn track(self: &Arc<Self>, target: &str) -> (CancellationToken, JobGuard) {
        let mut g = self.lock();
        let job = g.entry(target.to_string()).or_insert_with(|| TrackedJob {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: self.root.child_token(),
            live: 0,
        });
        job.live += 1;
        let guard = JobGuard {
            registry: Arc::clone(self),
            target: target.to_string(),
            generation: job.generation,
        };
        (job.token.clone(), guard)
    }

    /// Cancel every running invocation on `target`. Returns whether anything was tracked.
    pub fn cancel(&self, target: &str) -> bool {
        match self.lock().remove(target) {
            Some(job) => {
                log::info!("cancelling {} running job(s) for target {}", job.live, target);
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, target: &str) -> bool {
        self.lock().contains_key(target)
    }

    /// Number of live invocations on `target`.
    pub fn live(&self, target: &str) -> usize {
        self.lock().get(target).map(|j| j.live).unwrap_or(0)
    }

    fn release(&self, target: &str, generation: u64) {
        let mut g = self.lock();
        if let Some(job) = g.get_mut(target) {
            if job.generation != generation {
                return;
            }
            job.live = job.live.saturating_sub(1);
            if job.live == 0 {
                g.remove(target);
            }
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.release(&self.target, self.generation);
    }
}
