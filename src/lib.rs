//! Context Relay
//!
//! A realtime message relay: clients connect, join rooms derived from a
//! task/project context, post messages, and receive streamed responses plus a
//! bounded history replay on join.
//!
//! # Architecture
//!
//! - **Relay core**: sessions, rooms, history and cancellable response
//!   streaming, independent of any transport
//! - **Server**: Axum WebSocket transport that bridges sockets to sessions
//!
//! # Modules
//!
//! - [`relay`]: the session and streaming core
//! - [`events`]: inbound/outbound event and message types
//! - [`config`]: layered configuration (defaults, file, env, CLI)
//! - [`error`]: error taxonomy
//! - [`server`]: HTTP/WebSocket transport

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod events;
pub mod relay;
pub mod server;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::relay::ConnectionManager;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Relay core owning every session, room and history log.
    pub manager: ConnectionManager,
    /// Global configuration.
    pub config: Arc<AppConfig>,
}
