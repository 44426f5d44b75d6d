//! Orchestrator: owns the command registry and one (dispatcher, backend) pair per
//! configured backend.

use crate::channels::{
    build_backend, queue_pair, BackendPorts, BackendRegistry, ChatBackend, IncomingPayload,
};
use crate::config::{BackendConfig, Config};
use crate::dispatch::{mapping_prefix, Dispatcher, Handler, PatternRegistry};
use crate::error::{BackendError, InjectError};
use crate::scheduler::Scheduler;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Builds a backend once its queues exist.
pub type BackendFactory =
    Box<dyn FnOnce(BackendPorts) -> Result<Arc<dyn ChatBackend>, BackendError> + Send>;

struct PendingBackend {
    id: String,
    factory: BackendFactory,
}

/// Cloneable entry point into the inbound queues of running backends.
#[derive(Clone, Default)]
pub struct Injector {
    inbound: Arc<HashMap<String, mpsc::Sender<IncomingPayload>>>,
}

impl Injector {
    /// Queue `payload` as if `backend_id` had received it.
    pub async fn inject(&self, backend_id: &str, payload: IncomingPayload) -> Result<(), InjectError> {
        let queue = self
            .inbound
            .get(backend_id)
            .ok_or_else(|| InjectError::UnknownBackend(backend_id.to_string()))?;
        log::debug!("injecting '{}' into {}:{}", payload.text, backend_id, payload.target);
        queue
            .send(payload)
            .await
            .map_err(|_| InjectError::Closed(backend_id.to_string()))
    }

    pub fn has_backend(&self, backend_id: &str) -> bool {
        self.inbound.contains_key(backend_id)
    }
}

struct Running {
    backends: BackendRegistry,
    injector: Injector,
    shutdown: CancellationToken,
}

pub struct Orchestrator {
    config: Config,
    registry: PatternRegistry,
    pending: Vec<PendingBackend>,
    running: Option<Running>,
}

impl Orchestrator {
    /// Orchestrator for `config`; each configured backend is built on [`start`](Self::start).
    pub fn new(config: Config) -> Self {
        let backends = config.backends.clone();
        let mut orchestrator = Self {
            config,
            registry: PatternRegistry::new(),
            pending: Vec::new(),
            running: None,
        };
        for backend in backends {
            orchestrator.push_backend(backend);
        }
        orchestrator
    }

    fn push_backend(&mut self, backend: BackendConfig) {
        let id = backend.id().to_string();
        self.add_custom_backend(id, move |ports| build_backend(&backend, ports));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// Register a command. Order matters: the first matching pattern wins.
    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        help: impl Into<String>,
        handler: Handler,
    ) -> &mut Self {
        self.registry.register(pattern, help, handler);
        self
    }

    /// Copy another orchestrator's commands (not its backends) after ours.
    pub fn import_from(&mut self, other: &Orchestrator) -> &mut Self {
        self.registry.import_from(&other.registry);
        self
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Add a backend described by configuration.
    pub fn add_backend(&mut self, backend: BackendConfig) -> &mut Self {
        self.config.backends.push(backend.clone());
        self.push_backend(backend);
        self
    }

    /// Add a backend built by `factory` from its queue ports when the orchestrator starts.
    pub fn add_custom_backend<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: FnOnce(BackendPorts) -> Result<Arc<dyn ChatBackend>, BackendError> + Send + 'static,
    {
        self.pending.push(PendingBackend {
            id: id.into(),
            factory: Box::new(factory),
        });
        self
    }

    /// Help listing of the registered commands, as `help` replies with it.
    pub fn help_text(&self) -> String {
        self.registry
            .render_help(self.name(), &self.config.abort_keywords)
    }

    /// Registered commands, not counting the generated help entries.
    pub fn pattern_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Ids of running backends, or of configured ones before start.
    pub async fn backend_ids(&self) -> Vec<String> {
        match &self.running {
            Some(running) => running.backends.ids().await,
            None => {
                let mut ids: Vec<String> = self.pending.iter().map(|p| p.id.clone()).collect();
                ids.sort();
                ids
            }
        }
    }

    /// Start every backend with its dispatcher on `scheduler`. A second call is a no-op.
    ///
    /// Backends are consumed by a start: a stopped orchestrator does not restart them.
    pub async fn start(&mut self, scheduler: &Scheduler) -> Result<(), BackendError> {
        if self.running.is_some() {
            log::debug!("orchestrator already running");
            return Ok(());
        }
        let prefix = mapping_prefix(self.name());
        let registry = Arc::new(
            self.registry
                .clone()
                .with_help(self.name(), &self.config.abort_keywords),
        );
        let shutdown = CancellationToken::new();
        let backends = BackendRegistry::new();
        let mut inbound = HashMap::new();

        for pending in std::mem::take(&mut self.pending) {
            let (ports, dispatcher_ports) = queue_pair(scheduler.handle().clone());
            let injector = ports.inbound.clone();
            let backend = match (pending.factory)(ports) {
                Ok(backend) => backend,
                Err(e) => {
                    shutdown.cancel();
                    backends.stop_all().await;
                    return Err(e);
                }
            };
            let dispatcher = Dispatcher::new(
                pending.id.clone(),
                prefix.clone(),
                Arc::clone(&registry),
                self.config.abort_keywords.clone(),
                dispatcher_ports.outbound,
                scheduler.handle().clone(),
                shutdown.child_token(),
            );
            scheduler.spawn(dispatcher.run(dispatcher_ports.inbound, shutdown.clone()));
            if let Err(e) = backend.start().await {
                backend.stop();
                shutdown.cancel();
                backends.stop_all().await;
                return Err(e);
            }
            log::info!("backend {} started", pending.id);
            backends.register(backend).await;
            inbound.insert(pending.id, injector);
        }

        log::info!(
            "orchestrator{} running with {} command(s) on {} backend(s)",
            self.name().map(|n| format!(" {}", n)).unwrap_or_default(),
            registry.len(),
            inbound.len()
        );
        self.running = Some(Running {
            backends,
            injector: Injector {
                inbound: Arc::new(inbound),
            },
            shutdown,
        });
        Ok(())
    }

    /// Start when `autoStart` is set. Returns whether the orchestrator is running.
    pub async fn launch(&mut self, scheduler: &Scheduler) -> Result<bool, BackendError> {
        if self.config.auto_start {
            self.start(scheduler).await?;
        } else {
            log::info!("autoStart disabled, waiting for an explicit start");
        }
        Ok(self.is_running())
    }

    /// Handle to feed conversations into running backends.
    pub fn injector(&self) -> Option<Injector> {
        self.running.as_ref().map(|r| r.injector.clone())
    }

    /// Start a conversation programmatically, as if `backend_id` had received `payload`.
    pub async fn inject(
        &self,
        backend_id: &str,
        payload: IncomingPayload,
    ) -> Result<(), InjectError> {
        let running = self.running.as_ref().ok_or(InjectError::NotRunning)?;
        running.injector.inject(backend_id, payload).await
    }

    /// Cancel dispatch loops and handler tasks, then stop every backend.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
            running.backends.stop_all().await;
            log::info!("orchestrator stopped");
        }
    }
}
