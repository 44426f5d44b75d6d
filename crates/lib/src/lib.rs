//! Steward core library: chat command dispatch over pluggable chat backends.
//!
//! Commands are registered as (pattern, help, handler) on an [`Orchestrator`]; each
//! backend gets its own dispatcher that routes inbound messages to a pending ask or
//! to the first matching handler.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod scheduler;

pub use dispatch::{handler, Ask, Conversation};
pub use orchestrator::{Injector, Orchestrator};
pub use scheduler::Scheduler;
