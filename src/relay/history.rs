//! Bounded, room-keyed message history.
//!
//! History is volatile: it lives as long as the store and is never persisted.
//! Each room keeps at most `capacity` messages; appending past the cap evicts
//! the oldest entries first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::events::Message;
use crate::relay::rooms::RoomId;

/// Default number of messages retained per room.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Default number of messages replayed on join.
pub const DEFAULT_REPLAY_LIMIT: usize = 50;

type RoomLog = Arc<Mutex<VecDeque<Message>>>;

/// Thread-safe history store.
///
/// The outer map is only write-locked when a room is first seen; appends and
/// reads lock the individual room's log, so rooms never contend with each other.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    inner: Arc<HistoryInner>,
}

#[derive(Debug)]
struct HistoryInner {
    capacity: usize,
    rooms: RwLock<HashMap<RoomId, RoomLog>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    /// Create a store keeping at most `capacity` messages per room.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                capacity: capacity.max(1),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Append a message to a room, evicting the oldest entries past the cap.
    pub async fn append(&self, room: &RoomId, message: Message) {
        let log = self.log(room).await;
        let mut guard = log.lock().await;
        guard.push_back(message);
        while guard.len() > self.inner.capacity {
            guard.pop_front();
        }
    }

    /// Up to `limit` most recent messages, oldest first.
    ///
    /// Unknown rooms yield an empty vector.
    pub async fn recent(&self, room: &RoomId, limit: usize) -> Vec<Message> {
        let log = {
            let rooms = self.inner.rooms.read().await;
            match rooms.get(room) {
                Some(log) => Arc::clone(log),
                None => return Vec::new(),
            }
        };
        let guard = log.lock().await;
        let skip = guard.len().saturating_sub(limit);
        guard.iter().skip(skip).cloned().collect()
    }

    /// Number of messages currently stored for a room.
    pub async fn len(&self, room: &RoomId) -> usize {
        let log = {
            let rooms = self.inner.rooms.read().await;
            match rooms.get(room) {
                Some(log) => Arc::clone(log),
                None => return 0,
            }
        };
        log.lock().await.len()
    }

    /// Number of rooms that have ever received a message.
    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    async fn log(&self, room: &RoomId) -> RoomLog {
        {
            let rooms = self.inner.rooms.read().await;
            if let Some(log) = rooms.get(room) {
                return Arc::clone(log);
            }
        }

        let mut rooms = self.inner.rooms.write().await;
        Arc::clone(rooms.entry(room.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Context;

    fn msg(content: &str) -> Message {
        Message::user(content, Context::default(), "tester")
    }

    #[tokio::test]
    async fn test_recent_is_oldest_first() {
        let store = HistoryStore::default();
        let room = RoomId::general();
        for i in 0..5 {
            store.append(&room, msg(&format!("m{i}"))).await;
        }

        let recent = store.recent(&room, 3).await;
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        let all = store.recent(&room, 50).await;
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].content, "m0");
    }

    #[tokio::test]
    async fn test_unknown_room_is_empty() {
        let store = HistoryStore::default();
        assert!(store.recent(&RoomId::from("task:nope"), 10).await.is_empty());
        assert_eq!(store.len(&RoomId::from("task:nope")).await, 0);
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recent() {
        let store = HistoryStore::default();
        let room = RoomId::from("project:p1");
        for i in 0..1005 {
            store.append(&room, msg(&i.to_string())).await;
        }

        assert_eq!(store.len(&room).await, DEFAULT_HISTORY_CAPACITY);
        let kept = store.recent(&room, usize::MAX).await;
        assert_eq!(kept.len(), 1000);
        assert_eq!(kept.first().unwrap().content, "5");
        assert_eq!(kept.last().unwrap().content, "1004");
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let store = HistoryStore::new(2);
        let a = RoomId::from("task:a");
        let b = RoomId::from("task:b");
        store.append(&a, msg("a1")).await;
        store.append(&a, msg("a2")).await;
        store.append(&a, msg("a3")).await;
        store.append(&b, msg("b1")).await;

        assert_eq!(store.len(&a).await, 2);
        assert_eq!(store.len(&b).await, 1);
        assert_eq!(store.room_count().await, 2);
    }
}
