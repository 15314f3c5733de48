use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{RwLock, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelaySettings;
use crate::error::{RelayError, Result};
use crate::events::{InboundEvent, OutboundEvent, event_name};
use crate::relay::controller::StreamController;
use crate::relay::generator::ResponseGenerator;
use crate::relay::history::HistoryStore;
use crate::relay::pacing::{IntervalPacer, Pacer};
use crate::relay::rooms::{RoomId, RoomRegistry};
use crate::relay::session::{ConnectionId, Handshake, Identity, Session};

/// State shared by the manager, its sessions and their stream tasks.
#[derive(Debug)]
pub(crate) struct RelayShared {
    pub(crate) settings: RelaySettings,
    pub(crate) rooms: RoomRegistry,
    pub(crate) history: HistoryStore,
    pub(crate) generator: Arc<dyn ResponseGenerator>,
    pub(crate) pacer: Arc<dyn Pacer>,
    pub(crate) tasks: TaskTracker,
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    shutting_down: AtomicBool,
}

impl RelayShared {
    /// Deliver `event` to every member of `room`, and to `origin` if it is
    /// not a member.
    ///
    /// The origin's queue is awaited until `controller` is interrupted; other
    /// members get the event only if their queue has room, so a lagging
    /// reader never stalls someone else's stream.
    pub(crate) async fn fan_out(
        &self,
        room: &RoomId,
        origin: &Session,
        controller: &StreamController,
        event: OutboundEvent,
    ) {
        let members = self.rooms.members(room).await;
        let recipients: Vec<Session> = {
            let sessions = self.sessions.read().await;
            members
                .iter()
                .filter(|id| *id != origin.connection_id())
                .filter_map(|id| sessions.get(id).cloned())
                .collect()
        };

        tokio::select! {
            _ = origin.emit(event.clone()) => {}
            () = controller.cancelled() => {
                debug!(
                    connection_id = %origin.connection_id(),
                    event = event_name(&event),
                    "Stream interrupted while waiting on the outbound queue"
                );
            }
        }
        for session in recipients {
            session.try_emit(event.clone());
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Close a session: interrupt its stream, leave its room, forget it.
    ///
    /// Idempotent; only the first call does anything.
    pub(crate) async fn disconnect(&self, session: &Session) {
        if !session.begin_closing() {
            return;
        }

        if let Some(controller) = session.take_active_stream() {
            if controller.interrupt() {
                info!(
                    name: "relay.stream.interrupted",
                    connection_id = %session.connection_id(),
                    message_id = %controller.message_id(),
                    "Stream interrupted by disconnect"
                );
            }
        }
        let room = self.rooms.leave(session).await;
        self.sessions.write().await.remove(session.connection_id());
        session.mark_closed();

        let now = Utc::now();
        info!(
            name: "relay.session.closed",
            connection_id = %session.connection_id(),
            identity = %session.identity(),
            room = ?room.as_ref().map(RoomId::as_str),
            connected_for_ms = (now - session.connected_at()).num_milliseconds(),
            idle_ms = (now - session.last_activity()).num_milliseconds(),
            "Session closed"
        );
    }
}

/// Accepts and removes sessions, fans out room events, and sequences shutdown.
///
/// Cheap to clone. Every component it uses (rooms, history, generator,
/// pacing) is owned by the manager instance rather than global.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    shared: Arc<RelayShared>,
}

impl ConnectionManager {
    /// Create a manager that paces output according to `settings`.
    #[must_use]
    pub fn new(settings: RelaySettings, generator: Arc<dyn ResponseGenerator>) -> Self {
        let pacer = Arc::new(IntervalPacer::from_settings(&settings));
        Self::with_pacer(settings, generator, pacer)
    }

    /// Create a manager with an explicit pacing policy.
    #[must_use]
    pub fn with_pacer(
        settings: RelaySettings,
        generator: Arc<dyn ResponseGenerator>,
        pacer: Arc<dyn Pacer>,
    ) -> Self {
        let history = HistoryStore::new(settings.history_capacity);
        Self {
            shared: Arc::new(RelayShared {
                settings,
                rooms: RoomRegistry::new(),
                history,
                generator,
                pacer,
                tasks: TaskTracker::new(),
                sessions: RwLock::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RelaySettings {
        &self.shared.settings
    }

    #[must_use]
    pub fn history(&self) -> &HistoryStore {
        &self.shared.history
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomRegistry {
        &self.shared.rooms
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    pub async fn session(&self, id: &ConnectionId) -> Option<Session> {
        self.shared.sessions.read().await.get(id).cloned()
    }

    /// Accept a connection.
    ///
    /// Events for the session are queued on `outbound`. Fails with
    /// [`RelayError::ConnectionRejected`] if the handshake has no identity or
    /// the manager is shutting down.
    #[instrument(skip_all, fields(connection_id = tracing::field::Empty))]
    pub async fn connect(
        &self,
        handshake: Handshake,
        outbound: mpsc::Sender<OutboundEvent>,
    ) -> Result<Session> {
        let identity = Identity::parse(handshake.identity.as_deref()).inspect_err(|err| {
            warn!(name: "relay.session.rejected", reason = %err, "Connection rejected");
        })?;

        let session = Session::new(identity, outbound);
        tracing::Span::current().record("connection_id", session.connection_id().as_str());
        {
            let mut sessions = self.shared.sessions.write().await;
            if self.is_shutting_down() {
                session.mark_closed();
                return Err(RelayError::ConnectionRejected(
                    "relay is shutting down".to_string(),
                ));
            }
            sessions.insert(session.connection_id().clone(), session.clone());
        }
        session.activate();

        info!(
            name: "relay.session.connected",
            identity = %session.identity(),
            "Session connected"
        );
        Ok(session)
    }

    /// Handle one inbound event for `session`.
    ///
    /// Failures are logged and reported to `session` as an `error` event;
    /// they never affect other sessions.
    pub async fn dispatch(&self, session: &Session, event: InboundEvent) {
        let kind = event.kind();
        if let Err(err) = session.dispatch(&self.shared, event).await {
            match &err {
                RelayError::InvariantViolation(_) => {
                    error!(name: "relay.invariant", event = kind, error = %err, "Invariant violated");
                }
                _ => {
                    warn!(name: "relay.dispatch.failed", event = kind, error = %err, "Dispatch failed");
                }
            }
            if session.is_active() {
                session.emit(OutboundEvent::error(err.to_string())).await;
            }
        }
    }

    /// Transport-initiated disconnect.
    pub async fn disconnect(&self, session: &Session) {
        self.shared.disconnect(session).await;
    }

    /// Drain every session.
    ///
    /// Interrupts all active streams first, waits (bounded by
    /// `shutdown_grace_ms`) for their tasks to finish, then closes every
    /// session. New connections are refused from the moment this is called.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        let sessions: Vec<Session> = self.shared.sessions.read().await.values().cloned().collect();
        info!(name: "relay.shutdown.started", sessions = sessions.len(), "Shutting down relay");

        let mut interrupted = 0usize;
        for session in &sessions {
            if session.interrupt() {
                interrupted += 1;
            }
        }

        self.shared.tasks.close();
        let grace = self.shared.settings.shutdown_grace();
        if tokio::time::timeout(grace, self.shared.tasks.wait()).await.is_err() {
            warn!(
                name: "relay.shutdown.timeout",
                pending = self.shared.tasks.len(),
                "Streams still running after grace period"
            );
        }

        for session in &sessions {
            self.shared.disconnect(session).await;
        }
        let remaining = self.session_count().await;
        debug!(remaining, "Sessions drained");

        info!(
            name: "relay.shutdown.completed",
            sessions = sessions.len(),
            interrupted,
            "Relay shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::generator::EchoGenerator;
    use crate::relay::pacing::Immediate;

    fn manager() -> ConnectionManager {
        ConnectionManager::with_pacer(
            RelaySettings::default(),
            Arc::new(EchoGenerator),
            Arc::new(Immediate),
        )
    }

    #[tokio::test]
    async fn test_connect_requires_identity() {
        let m = manager();
        let (tx, _rx) = mpsc::channel(4);
        let err = m.connect(Handshake::default(), tx).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionRejected(_)));
        assert_eq!(m.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let m = manager();
        let (tx, _rx) = mpsc::channel(4);
        let s = m.connect(Handshake::new("dave"), tx).await.unwrap();
        assert_eq!(m.session_count().await, 1);
        assert!(m.session(s.connection_id()).await.is_some());

        m.disconnect(&s).await;
        m.disconnect(&s).await;
        assert_eq!(m.session_count().await, 0);
        assert!(s.is_closed());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_shutdown_future_is_send() {
        let m = manager();
        let draining = m.shutdown();
        assert_send(&draining);
    }

    #[tokio::test]
    async fn test_connect_refused_after_shutdown() {
        let m = manager();
        m.shutdown().await;
        let (tx, _rx) = mpsc::channel(4);
        assert!(m.connect(Handshake::new("erin"), tx).await.is_err());
    }
}
