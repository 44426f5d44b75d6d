//! Gateway: HTTP control plane for a running orchestrator.
//!
//! `GET /` reports health; `POST /inject` starts a conversation on a backend.

mod server;

pub use server::{router, run_gateway, GatewayState, InjectRequest};
