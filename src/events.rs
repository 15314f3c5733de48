//! Event and message types exchanged between the relay and its clients.
//!
//! Events are transport-agnostic: the host decides how to carry them. The
//! bundled WebSocket transport encodes them as adjacently tagged JSON
//! (`{"type": "...", "data": {...}}`) with camelCase field names.
//!
//! # Inbound
//!
//! - `join`: enter the room derived from a [`Context`]
//! - `send`: post a message and stream a response
//! - `interrupt`: stop the session's in-flight response
//! - `disconnect`: leave the relay
//!
//! # Outbound
//!
//! - `history_loaded`: replay sent on join
//! - `thinking_update`: staged progress before the response
//! - `message_chunk`: one piece of a streamed response
//! - `message_posted`: a user message accepted into a room
//! - `error`: a failed operation, sent to the originating session only
//!
//! # Example
//!
//! ```rust
//! use context_relay::events::{InboundEvent, event_name, OutboundEvent};
//!
//! let event: InboundEvent =
//!     serde_json::from_str(r#"{"type":"join","data":{"context":{"taskId":"t1"}}}"#).unwrap();
//! assert!(matches!(event, InboundEvent::Join { .. }));
//!
//! let err = OutboundEvent::error("boom");
//! assert_eq!(event_name(&err), "error");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-supplied descriptor used to derive a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

impl Context {
    /// Context scoped to a task.
    #[must_use]
    pub fn task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    /// Context scoped to a project.
    #[must_use]
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    /// The task id, if set to a non-empty value.
    #[must_use]
    pub fn task_key(&self) -> Option<&str> {
        self.task_id.as_deref().filter(|id| !id.is_empty())
    }

    /// The project id, if set to a non-empty value.
    #[must_use]
    pub fn project_key(&self) -> Option<&str> {
        self.project_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Identifier for a stored message or a streamed response.
///
/// Built from a millisecond timestamp and a random suffix. Collisions are
/// improbable, not impossible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Allocate a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "msg_{}_{}",
            Utc::now().timestamp_millis(),
            &suffix[..9]
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message stored in a room's history. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub context: Context,
    /// Identity of the sender; only set for user messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_identity: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A user message posted by `identity`.
    #[must_use]
    pub fn user(content: impl Into<String>, context: Context, identity: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            role: MessageRole::User,
            content: content.into(),
            context,
            originating_identity: Some(identity.into()),
            created_at: Utc::now(),
        }
    }

    /// A completed assistant response, stored under the id its chunks carried.
    #[must_use]
    pub fn assistant(id: MessageId, content: impl Into<String>, context: Context) -> Self {
        Self {
            id,
            role: MessageRole::Assistant,
            content: content.into(),
            context,
            originating_identity: None,
            created_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of a `send` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub content: String,
    /// Falls back to the session's current context when absent.
    #[serde(default)]
    pub context: Option<Context>,
    #[serde(default)]
    pub include_thinking: bool,
}

/// Events a session accepts while active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Enter the room resolved from `context`, replacing any current room.
    Join {
        #[serde(default)]
        context: Context,
    },
    /// Post a message and stream the response.
    Send(SendRequest),
    /// Stop the in-flight response, if any.
    Interrupt,
    /// Leave the relay. Transports also raise this when the socket closes.
    Disconnect,
}

impl InboundEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Send(_) => "send",
            Self::Interrupt => "interrupt",
            Self::Disconnect => "disconnect",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Icon and label describing a thinking stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingKind {
    pub icon: String,
    pub label: String,
}

/// One step inside a thinking stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Progress event emitted before a response is streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingUpdate {
    #[serde(rename = "type")]
    pub kind: ThinkingKind,
    pub stage: String,
    pub new_step: ThinkingStep,
}

impl ThinkingUpdate {
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        icon: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            kind: ThinkingKind {
                icon: icon.into(),
                label: label.into(),
            },
            stage: stage.into(),
            new_step: ThinkingStep {
                description: description.into(),
                detail,
                timestamp: Utc::now(),
            },
        }
    }
}

/// One ordered piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageChunk {
    pub message_id: MessageId,
    pub content: String,
    /// True only on the final chunk of the message.
    pub is_complete: bool,
}

/// Events the relay delivers to sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Recent room history, oldest first.
    HistoryLoaded { messages: Vec<Message> },
    ThinkingUpdate(ThinkingUpdate),
    MessageChunk(MessageChunk),
    /// A user message was accepted into the room.
    MessagePosted { message: Message },
    Error { message: String },
}

impl OutboundEvent {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Wire name of an [`OutboundEvent`].
pub fn event_name(evt: &OutboundEvent) -> &'static str {
    match evt {
        OutboundEvent::HistoryLoaded { .. } => "history_loaded",
        OutboundEvent::ThinkingUpdate(_) => "thinking_update",
        OutboundEvent::MessageChunk(_) => "message_chunk",
        OutboundEvent::MessagePosted { .. } => "message_posted",
        OutboundEvent::Error { .. } => "error",
    }
}

/// Serialize an [`OutboundEvent`] to its JSON wire form.
///
/// Serialization cannot fail for these types in practice; if it ever does,
/// an `error` event describing the failure is produced instead.
pub fn to_json(evt: &OutboundEvent) -> String {
    serde_json::to_string(evt).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "data": { "message": e.to_string() } }).to_string()
    })
}
