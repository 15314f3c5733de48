//! Room resolution and membership.
//!
//! A room is a broadcast scope derived from a [`Context`]. Rooms are created
//! lazily on first use and live as long as the registry. A session belongs
//! to at most one room at a time.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::events::Context;
use crate::relay::session::{ConnectionId, Session};

/// Room used when a context names neither a task nor a project.
pub const GENERAL_ROOM: &str = "general";

/// Derived room key, e.g. `task:t1`, `project:p1` or `general`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    #[must_use]
    pub fn general() -> Self {
        Self(GENERAL_ROOM.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the room for a context.
///
/// A task id wins over a project id; with neither set the room is `general`.
/// Empty ids count as unset.
#[must_use]
pub fn resolve_room(context: &Context) -> RoomId {
    if let Some(task) = context.task_key() {
        RoomId(format!("task:{task}"))
    } else if let Some(project) = context.project_key() {
        RoomId(format!("project:{project}"))
    } else {
        RoomId::general()
    }
}

type Members = Arc<RwLock<HashSet<ConnectionId>>>;

/// Tracks which sessions are in which room.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<RoomId, Members>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `session` into the room resolved from `context`.
    ///
    /// Leaves the session's previous room, if any, and records `context` as
    /// its current context. Never fails.
    pub async fn join(&self, session: &Session, context: Context) -> RoomId {
        let room = resolve_room(&context);
        let previous = session.enter_room(room.clone(), context);

        if let Some(prev) = previous.filter(|prev| *prev != room) {
            self.remove_member(&prev, session.connection_id()).await;
        }
        self.members_of(&room)
            .await
            .write()
            .await
            .insert(session.connection_id().clone());

        // A disconnect may have raced this join; do not leave a ghost member.
        if session.is_closed() {
            self.remove_member(&room, session.connection_id()).await;
        }

        debug!(
            name: "relay.room.joined",
            connection_id = %session.connection_id(),
            room = %room,
            "Session joined room"
        );
        room
    }

    /// Remove `session` from its current room, if any.
    pub async fn leave(&self, session: &Session) -> Option<RoomId> {
        let room = session.exit_room()?;
        self.remove_member(&room, session.connection_id()).await;
        Some(room)
    }

    /// Connection ids currently in `room`.
    pub async fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        let members = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(members) => Arc::clone(members),
                None => return Vec::new(),
            }
        };
        let guard = members.read().await;
        guard.iter().cloned().collect()
    }

    pub async fn is_member(&self, room: &RoomId, connection: &ConnectionId) -> bool {
        let rooms = self.rooms.read().await;
        match rooms.get(room) {
            Some(members) => members.read().await.contains(connection),
            None => false,
        }
    }

    /// Number of rooms created so far, including empty ones.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn remove_member(&self, room: &RoomId, connection: &ConnectionId) {
        let members = {
            let rooms = self.rooms.read().await;
            rooms.get(room).map(Arc::clone)
        };
        if let Some(members) = members {
            members.write().await.remove(connection);
        }
    }

    async fn members_of(&self, room: &RoomId) -> Members {
        {
            let rooms = self.rooms.read().await;
            if let Some(members) = rooms.get(room) {
                return Arc::clone(members);
            }
        }

        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::Identity;
    use tokio::sync::mpsc;

    fn session() -> Session {
        let (tx, _rx) = mpsc::channel(8);
        Session::new(Identity::parse(Some("alice")).unwrap(), tx)
    }

    #[test]
    fn test_resolve_room_rules() {
        assert_eq!(resolve_room(&Context::task("t1")).as_str(), "task:t1");
        assert_eq!(resolve_room(&Context::project("p1")).as_str(), "project:p1");
        assert_eq!(resolve_room(&Context::default()).as_str(), "general");

        let both = Context {
            task_id: Some("t9".into()),
            project_id: Some("p9".into()),
            ..Context::default()
        };
        assert_eq!(resolve_room(&both).as_str(), "task:t9");
        assert_eq!(resolve_room(&both), resolve_room(&both.clone()));
    }

    #[test]
    fn test_names_do_not_affect_room() {
        let named = Context {
            project_id: Some("p1".into()),
            project_name: Some("Apollo".into()),
            ..Context::default()
        };
        assert_eq!(resolve_room(&named), resolve_room(&Context::project("p1")));
    }

    #[tokio::test]
    async fn test_join_moves_membership() {
        let registry = RoomRegistry::new();
        let s = session();

        let a = registry.join(&s, Context::task("a")).await;
        assert!(registry.is_member(&a, s.connection_id()).await);

        let b = registry.join(&s, Context::project("b")).await;
        assert!(!registry.is_member(&a, s.connection_id()).await);
        assert!(registry.is_member(&b, s.connection_id()).await);
        assert_eq!(s.current_context(), Some(Context::project("b")));
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_rejoin_same_room_keeps_membership() {
        let registry = RoomRegistry::new();
        let s = session();
        registry.join(&s, Context::task("a")).await;
        let room = registry.join(&s, Context::task("a")).await;
        assert_eq!(registry.members(&room).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_clears_membership() {
        let registry = RoomRegistry::new();
        let s = session();
        let room = registry.join(&s, Context::default()).await;
        assert_eq!(registry.leave(&s).await, Some(room.clone()));
        assert!(registry.members(&room).await.is_empty());
        assert_eq!(registry.leave(&s).await, None);
    }
}
