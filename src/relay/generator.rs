//! Response generation seam.
//!
//! The relay does not run inference itself. It hands each accepted message to
//! a [`ResponseGenerator`] and streams whatever comes back. Generators may
//! answer with a complete text or a lazy stream of text pieces, and may await
//! remote calls while doing so.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::GeneratorError;
use crate::events::{Context, MessageId, ThinkingUpdate};

/// Input handed to a generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Id the streamed response will carry.
    pub message_id: MessageId,
    pub content: String,
    pub context: Context,
    /// Identity of the sender.
    pub identity: String,
}

/// Output of a generator.
pub enum ResponseBody {
    /// The whole response at once.
    Text(String),
    /// A finite, non-restartable sequence of text pieces.
    Chunks(BoxStream<'static, Result<String, GeneratorError>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Chunks(_) => f.write_str("Chunks(..)"),
        }
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ResponseBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Turns an inbound message into a response.
#[async_trait]
pub trait ResponseGenerator: Send + Sync + fmt::Debug {
    /// Progress updates emitted before the response when the sender asks for
    /// them. Defaults to [`default_thinking_steps`].
    async fn thinking(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<ThinkingUpdate>, GeneratorError> {
        Ok(default_thinking_steps(request))
    }

    /// Produce the response.
    async fn generate(&self, request: &GenerationRequest) -> Result<ResponseBody, GeneratorError>;
}

/// Three-stage thinking sequence: analyzing, context, composing.
#[must_use]
pub fn default_thinking_steps(request: &GenerationRequest) -> Vec<ThinkingUpdate> {
    let scope = describe_scope(&request.context);
    vec![
        ThinkingUpdate::new(
            "analyzing",
            "🔍",
            "Analyzing",
            "Reading the message",
            Some(format!("{} characters", request.content.chars().count())),
        ),
        ThinkingUpdate::new(
            "context",
            "📋",
            "Gathering context",
            format!("Looking at {scope}"),
            None,
        ),
        ThinkingUpdate::new("composing", "✍️", "Composing", "Drafting a response", None),
    ]
}

fn describe_scope(context: &Context) -> String {
    if let Some(name) = context.task_name.as_deref().filter(|n| !n.is_empty()) {
        format!("task \"{name}\"")
    } else if let Some(id) = context.task_key() {
        format!("task {id}")
    } else if let Some(name) = context.project_name.as_deref().filter(|n| !n.is_empty()) {
        format!("project \"{name}\"")
    } else if let Some(id) = context.project_key() {
        format!("project {id}")
    } else {
        "the general room".to_string()
    }
}

/// Canned, context-aware replies. Used when no real generator is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoGenerator;

#[async_trait]
impl ResponseGenerator for EchoGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<ResponseBody, GeneratorError> {
        Ok(ResponseBody::Text(format!(
            "Received your message about {}: \"{}\"",
            describe_scope(&request.context),
            request.content.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(context: Context) -> GenerationRequest {
        GenerationRequest {
            message_id: MessageId::generate(),
            content: "status?".into(),
            context,
            identity: "carol".into(),
        }
    }

    #[tokio::test]
    async fn test_echo_mentions_scope() {
        let ctx = Context {
            task_id: Some("t1".into()),
            task_name: Some("Ship it".into()),
            ..Context::default()
        };
        let body = EchoGenerator.generate(&request(ctx)).await.unwrap();
        let ResponseBody::Text(text) = body else {
            panic!("expected text body");
        };
        assert!(text.contains("task \"Ship it\""));
        assert!(text.contains("status?"));
    }

    #[tokio::test]
    async fn test_default_thinking_has_three_stages() {
        let steps = EchoGenerator
            .thinking(&request(Context::project("p1")))
            .await
            .unwrap();
        let stages: Vec<_> = steps.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, vec!["analyzing", "context", "composing"]);
        assert_eq!(steps[1].new_step.description, "Looking at project p1");
    }
}
