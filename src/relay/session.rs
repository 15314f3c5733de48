//! Per-connection session state and inbound event dispatch.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::events::{Context, InboundEvent, OutboundEvent, event_name};
use crate::relay::controller::StreamController;
use crate::relay::manager::RelayShared;
use crate::relay::rooms::RoomId;
use crate::relay::streaming;

/// Unique id assigned to each accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity token presented at connection time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Validate a raw handshake value. Missing or blank values are rejected;
    /// anything else is kept verbatim.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw {
            Some(token) if !token.trim().is_empty() => Ok(Self(token.to_string())),
            _ => Err(RelayError::ConnectionRejected(
                "an identity token is required".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handshake payload handed over by the transport.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub identity: Option<String>,
}

impl Handshake {
    #[must_use]
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// One connected client.
///
/// Cheap to clone; all clones share the same state. A session is in at most
/// one room and owns at most one active [`StreamController`].
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connection_id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<OutboundEvent>,
    state: Mutex<SessionState>,
    placement: Mutex<Placement>,
    active_stream: Mutex<Option<StreamController>>,
    closed: CancellationToken,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
}

#[derive(Default)]
struct Placement {
    room: Option<RoomId>,
    context: Option<Context>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.inner.connection_id)
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .field("room", &self.current_room())
            .finish()
    }
}

/// Locks here are never held across an await, so a poisoned guard only means
/// another thread panicked mid-update of plain data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Create a session in the `Connecting` state.
    #[must_use]
    pub fn new(identity: Identity, outbound: mpsc::Sender<OutboundEvent>) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                connection_id: ConnectionId::new(),
                identity,
                outbound,
                state: Mutex::new(SessionState::Connecting),
                placement: Mutex::new(Placement::default()),
                active_stream: Mutex::new(None),
                closed: CancellationToken::new(),
                connected_at: now,
                last_activity: Mutex::new(now),
            }),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *lock(&self.inner.last_activity)
    }

    /// Resolves once the relay has closed this session.
    ///
    /// Transports wait on this to tear down the underlying connection.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    #[must_use]
    pub fn current_context(&self) -> Option<Context> {
        lock(&self.inner.placement).context.clone()
    }

    #[must_use]
    pub fn current_room(&self) -> Option<RoomId> {
        lock(&self.inner.placement).room.clone()
    }

    /// The controller of the in-flight response, if any.
    #[must_use]
    pub fn active_stream(&self) -> Option<StreamController> {
        lock(&self.inner.active_stream).clone()
    }

    /// Interrupt the in-flight response. Returns `false` when there is none
    /// or it was already interrupted.
    pub fn interrupt(&self) -> bool {
        self.active_stream()
            .is_some_and(|controller| controller.interrupt())
    }

    /// Queue an event for this session's transport.
    ///
    /// Returns `false` if the transport has gone away.
    pub async fn emit(&self, event: OutboundEvent) -> bool {
        match self.inner.outbound.send(event).await {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    connection_id = %self.inner.connection_id,
                    "Outbound channel closed, dropping event"
                );
                false
            }
        }
    }

    /// Queue an event without waiting for room in the transport's queue.
    ///
    /// Used for deliveries to other room members: a full queue drops the
    /// event for this session only.
    pub fn try_emit(&self, event: OutboundEvent) -> bool {
        match self.inner.outbound.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    name: "relay.session.lagging",
                    connection_id = %self.inner.connection_id,
                    event = event_name(&event),
                    "Outbound queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    connection_id = %self.inner.connection_id,
                    "Outbound channel closed, dropping event"
                );
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle transitions
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn activate(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if *state == SessionState::Connecting {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    /// Move to `Closing`. Returns `false` if closing already began.
    pub(crate) fn begin_closing(&self) -> bool {
        let mut state = lock(&self.inner.state);
        match *state {
            SessionState::Connecting | SessionState::Active => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    pub(crate) fn mark_closed(&self) {
        *lock(&self.inner.state) = SessionState::Closed;
        self.inner.closed.cancel();
    }

    fn touch(&self) {
        *lock(&self.inner.last_activity) = Utc::now();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Room placement (driven by the room registry)
    // ─────────────────────────────────────────────────────────────────────

    /// Record the new room and context, returning the previous room.
    pub(crate) fn enter_room(&self, room: RoomId, context: Context) -> Option<RoomId> {
        let mut placement = lock(&self.inner.placement);
        placement.context = Some(context);
        placement.room.replace(room)
    }

    pub(crate) fn exit_room(&self) -> Option<RoomId> {
        lock(&self.inner.placement).room.take()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stream controller slot
    // ─────────────────────────────────────────────────────────────────────

    /// Install a new active controller, returning the one it supersedes.
    pub(crate) fn replace_active_stream(
        &self,
        controller: StreamController,
    ) -> Option<StreamController> {
        lock(&self.inner.active_stream).replace(controller)
    }

    pub(crate) fn take_active_stream(&self) -> Option<StreamController> {
        lock(&self.inner.active_stream).take()
    }

    /// Let go of `controller` once its stream has finished.
    ///
    /// Clears the active slot only if it still holds this controller; a newer
    /// send may already have replaced it.
    pub(crate) fn release_stream(&self, controller: &StreamController) -> Result<()> {
        if !controller.mark_released() {
            return Err(RelayError::InvariantViolation(format!(
                "stream controller for {} released twice",
                controller.message_id()
            )));
        }

        let mut slot = lock(&self.inner.active_stream);
        if slot.as_ref().is_some_and(|active| active.same_as(controller)) {
            *slot = None;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    /// Handle one inbound event.
    #[instrument(
        skip(self, relay, event),
        fields(connection_id = %self.inner.connection_id, event = event.kind())
    )]
    pub(crate) async fn dispatch(
        &self,
        relay: &Arc<RelayShared>,
        event: InboundEvent,
    ) -> Result<()> {
        if !self.is_active() {
            if matches!(event, InboundEvent::Disconnect) {
                return Ok(());
            }
            return Err(RelayError::Dispatch("session is not active".to_string()));
        }
        self.touch();

        match event {
            InboundEvent::Join { context } => {
                let room = relay.rooms.join(self, context).await;
                let messages = relay
                    .history
                    .recent(&room, relay.settings.replay_limit)
                    .await;
                debug!(room = %room, replayed = messages.len(), "Replaying room history");
                self.emit(OutboundEvent::HistoryLoaded { messages }).await;
                Ok(())
            }
            InboundEvent::Send(request) => streaming::start(relay, self, request).await,
            InboundEvent::Interrupt => {
                if self.interrupt() {
                    info!(name: "relay.stream.interrupted", "Stream interrupted by client");
                } else {
                    debug!("Interrupt with no active stream");
                }
                Ok(())
            }
            InboundEvent::Disconnect => {
                relay.disconnect(self).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MessageId;

    fn session() -> (Session, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (Session::new(Identity::parse(Some("bob")).unwrap(), tx), rx)
    }

    #[test]
    fn test_identity_validation() {
        assert!(Identity::parse(None).is_err());
        assert!(Identity::parse(Some("")).is_err());
        assert!(Identity::parse(Some("   ")).is_err());
        assert_eq!(Identity::parse(Some(" u1 ")).unwrap().as_str(), " u1 ");
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (s, _rx) = session();
        assert_eq!(s.state(), SessionState::Connecting);
        assert!(s.activate());
        assert!(!s.activate());
        assert!(s.is_active());

        assert!(s.begin_closing());
        assert!(!s.begin_closing());
        assert!(s.is_closed());
        s.mark_closed();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_release_only_clears_own_controller() {
        let (s, _rx) = session();
        let first = StreamController::new(s.connection_id().clone(), MessageId::generate());
        let second = StreamController::new(s.connection_id().clone(), MessageId::generate());

        assert!(s.replace_active_stream(first.clone()).is_none());
        let superseded = s.replace_active_stream(second.clone()).unwrap();
        assert!(superseded.same_as(&first));

        s.release_stream(&first).unwrap();
        assert!(s.active_stream().unwrap().same_as(&second));

        s.release_stream(&second).unwrap();
        assert!(s.active_stream().is_none());

        assert!(matches!(
            s.release_stream(&second),
            Err(RelayError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_interrupt_without_stream_is_noop() {
        let (s, _rx) = session();
        assert!(!s.interrupt());

        let c = StreamController::new(s.connection_id().clone(), MessageId::generate());
        s.replace_active_stream(c.clone());
        assert!(s.interrupt());
        assert!(c.is_interrupted());
        assert!(!s.interrupt());
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (s, rx) = session();
        assert!(s.emit(OutboundEvent::error("first")).await);
        drop(rx);
        assert!(!s.emit(OutboundEvent::error("second")).await);
    }

    #[tokio::test]
    async fn test_try_emit_drops_when_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let s = Session::new(Identity::parse(Some("slow")).unwrap(), tx);
        assert!(s.try_emit(OutboundEvent::error("queued")));
        assert!(!s.try_emit(OutboundEvent::error("dropped")));

        assert_eq!(rx.recv().await, Some(OutboundEvent::error("queued")));
        assert!(rx.try_recv().is_err());
        drop(rx);
        assert!(!s.try_emit(OutboundEvent::error("gone")));
    }

    #[test]
    fn test_touch_advances_last_activity() {
        let (s, _rx) = session();
        let before = s.last_activity();
        assert_eq!(before, s.connected_at());
        s.touch();
        assert!(s.last_activity() >= before);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_mark_closed() {
        let (s, _rx) = session();
        let waiter = s.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        s.mark_closed();
        handle.await.unwrap();
    }
}
