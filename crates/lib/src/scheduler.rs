//! Worker pool that runs dispatch loops, backend I/O and handler tasks.

use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Lower bound on the number of workers of an owned pool.
pub const MIN_WORKERS: usize = 4;

/// Pool size: `max(4, host parallelism)`.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS)
        .max(MIN_WORKERS)
}

/// An explicitly created task scheduler. Either owns a multi-thread runtime or borrows
/// the runtime it was created in.
pub struct Scheduler {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl Scheduler {
    /// Owned pool with [`default_workers`] threads.
    pub fn new() -> std::io::Result<Self> {
        Self::with_workers(default_workers())
    }

    pub fn with_workers(workers: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("steward-worker")
            .enable_all()
            .build()?;
        log::debug!("scheduler: started {} worker(s)", workers.max(1));
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Borrow the runtime of the calling task. Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self {
            runtime: None,
            handle: Handle::current(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_owned(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run a future to completion on the pool from synchronous code.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        match &self.runtime {
            Some(runtime) => runtime.block_on(future),
            None => self.handle.block_on(future),
        }
    }

    /// Stop an owned pool without waiting for running tasks. No-op when borrowed.
    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            log::debug!("scheduler: shutting down");
            runtime.shutdown_background();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_has_at_least_four_workers() {
        assert!(default_workers() >= MIN_WORKERS);
    }

    #[test]
    fn owned_pool_runs_tasks() {
        let scheduler = Scheduler::with_workers(2).expect("runtime");
        let value = scheduler.block_on(async {
            tokio::spawn(async { 21 * 2 }).await.expect("join")
        });
        assert_eq!(value, 42);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn borrowed_pool_spawns_on_current_runtime() {
        let scheduler = Scheduler::current();
        assert!(!scheduler.is_owned());
        assert_eq!(scheduler.spawn(async { 7 }).await.expect("join"), 7);
    }
}
