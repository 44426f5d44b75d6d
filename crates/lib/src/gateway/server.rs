//! Gateway HTTP server.

use crate::channels::IncomingPayload;
use crate::config::{self, GatewayConfig};
use crate::error::InjectError;
use crate::orchestrator::{Injector, Orchestrator};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub name: Option<String>,
    pub port: u16,
    pub backends: Arc<Vec<String>>,
    pub patterns: usize,
    pub injector: Injector,
    /// When Some, `POST /inject` requires `Authorization: Bearer <token>`.
    pub required_token: Option<String>,
}

impl GatewayState {
    /// Snapshot of a started orchestrator.
    pub async fn from_orchestrator(orchestrator: &Orchestrator, gateway: &GatewayConfig) -> Self {
        Self {
            name: orchestrator.name().map(str::to_string),
            port: gateway.port,
            backends: Arc::new(orchestrator.backend_ids().await),
            patterns: orchestrator.pattern_count(),
            injector: orchestrator.injector().unwrap_or_default(),
            required_token: config::resolve_gateway_token(gateway),
        }
    }
}

/// Body of `POST /inject`.
#[derive(Debug, Clone, Deserialize)]
pub struct InjectRequest {
    pub backend: String,
    pub target: String,
    #[serde(default)]
    pub username: Option<String>,
    pub text: String,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/inject", post(inject_http))
        .with_state(state)
}

/// Serve the gateway on `gateway.bind:gateway.port` until `shutdown` completes.
/// When bind is not loopback, a gateway token must be configured or startup fails.
pub async fn run_gateway(
    gateway: &GatewayConfig,
    state: GatewayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind = gateway.bind.trim();
    if !config::is_loopback_bind(bind) && state.required_token.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.token or STEWARD_GATEWAY_TOKEN)",
            bind
        );
    }
    let bind_addr = format!("{}:{}", bind, gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// GET / returns a simple health JSON.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "name": state.name,
        "backends": state.backends.as_slice(),
        "patterns": state.patterns,
        "port": state.port,
    }))
}

fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.required_token.as_deref() else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|provided| provided.trim() == expected)
        .unwrap_or(false)
}

/// POST /inject queues a message on a backend's inbound path.
async fn inject_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<InjectRequest>,
) -> StatusCode {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let payload = IncomingPayload::new(request.target, request.username, request.text);
    match state.injector.inject(&request.backend, payload).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(InjectError::UnknownBackend(id)) => {
            log::debug!("gateway: inject for unknown backend {}", id);
            StatusCode::NOT_FOUND
        }
        Err(e) => {
            log::warn!("gateway: inject failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(token: Option<&str>) -> GatewayState {
        GatewayState {
            name: None,
            port: 0,
            backends: Arc::new(Vec::new()),
            patterns: 0,
            injector: Injector::default(),
            required_token: token.map(str::to_string),
        }
    }

    #[test]
    fn bearer_token_is_checked_when_configured() {
        let mut headers = HeaderMap::new();
        assert!(authorized(&state(None), &headers));
        assert!(!authorized(&state(Some("s3cret")), &headers));
        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().expect("header"));
        assert!(authorized(&state(Some("s3cret")), &headers));
        headers.insert(header::AUTHORIZATION, "Bearer nope".parse().expect("header"));
        assert!(!authorized(&state(Some("s3cret")), &headers));
    }

    #[tokio::test]
    async fn refuses_public_bind_without_token() {
        if std::env::var("STEWARD_GATEWAY_TOKEN").is_ok() {
            return;
        }
        let gateway = GatewayConfig {
            bind: "0.0.0.0".to_string(),
            ..GatewayConfig::default()
        };
        let result = run_gateway(&gateway, state(None), std::future::pending()).await;
        assert!(result.is_err());
    }
}
