//! Room-scoped session and streaming-response core.
//!
//! The relay is transport-agnostic: a host hands the [`ConnectionManager`]
//! one bounded channel per client and feeds it [`InboundEvent`]s. Everything
//! else happens here.
//!
//! # Components
//!
//! - [`StreamController`]: cancellation token for one in-flight response
//! - [`HistoryStore`]: bounded per-room message log
//! - [`RoomRegistry`]: room resolution and membership
//! - [`Session`]: one connected client and its event dispatch
//! - [`ResponseGenerator`]: seam for whatever produces responses
//! - [`Pacer`]: pacing between thinking steps and chunks
//! - [`ConnectionManager`]: session lifecycle, fan-out and shutdown
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use context_relay::config::RelaySettings;
//! use context_relay::events::{Context, InboundEvent, OutboundEvent};
//! use context_relay::relay::{ConnectionManager, EchoGenerator, Handshake};
//! use tokio::sync::mpsc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = ConnectionManager::new(RelaySettings::default(), Arc::new(EchoGenerator));
//! let (tx, mut rx) = mpsc::channel(64);
//! let session = manager.connect(Handshake::new("alice"), tx).await.unwrap();
//!
//! manager
//!     .dispatch(&session, InboundEvent::Join { context: Context::task("t1") })
//!     .await;
//! assert!(matches!(rx.recv().await, Some(OutboundEvent::HistoryLoaded { .. })));
//! # }
//! ```
//!
//! [`InboundEvent`]: crate::events::InboundEvent

pub mod controller;
pub mod generator;
pub mod history;
pub mod manager;
pub mod pacing;
pub mod rooms;
pub mod session;
pub mod streaming;

pub use controller::StreamController;
pub use generator::{EchoGenerator, GenerationRequest, ResponseBody, ResponseGenerator};
pub use history::HistoryStore;
pub use manager::ConnectionManager;
pub use pacing::{Immediate, IntervalPacer, PacePhase, Pacer};
pub use rooms::{RoomId, RoomRegistry, resolve_room};
pub use session::{ConnectionId, Handshake, Identity, Session, SessionState};
pub use streaming::split_chunks;
