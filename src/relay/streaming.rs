//! The streaming response protocol.
//!
//! A `send` stores the user message, then a spawned task optionally emits
//! thinking updates, asks the generator for a response and fans it out in
//! fixed-size chunks. The session's [`StreamController`] is checked at every
//! boundary; once it is interrupted no further chunk is emitted and the
//! assistant message is not stored.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{GeneratorError, RelayError, Result};
use crate::events::{Message, MessageChunk, MessageId, OutboundEvent, SendRequest};
use crate::relay::controller::StreamController;
use crate::relay::generator::{GenerationRequest, ResponseBody};
use crate::relay::manager::RelayShared;
use crate::relay::pacing::PacePhase;
use crate::relay::rooms::{RoomId, resolve_room};
use crate::relay::session::Session;

/// Default number of characters per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Split `text` into pieces of at most `size` characters, in order.
///
/// Counts Unicode scalar values, so multi-byte characters are never cut.
/// A size of zero is treated as one.
#[must_use]
pub fn split_chunks(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|piece| piece.iter().collect())
        .collect()
}

/// Flatten a generator response into chunk-sized pieces.
fn chunk_stream(body: ResponseBody, size: usize) -> BoxStream<'static, Result<String, GeneratorError>> {
    match body {
        ResponseBody::Text(text) => stream::iter(split_chunks(&text, size).into_iter().map(Ok)).boxed(),
        ResponseBody::Chunks(pieces) => pieces
            .flat_map(move |item| {
                let split: Vec<Result<String, GeneratorError>> = match item {
                    Ok(text) => split_chunks(&text, size).into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(err)],
                };
                stream::iter(split)
            })
            .boxed(),
    }
}

/// Accept a `send` from `session` and start streaming the response.
///
/// Returns once the user message is stored and the stream task is spawned.
pub(crate) async fn start(
    relay: &Arc<RelayShared>,
    session: &Session,
    request: SendRequest,
) -> Result<()> {
    if request.content.trim().is_empty() {
        return Err(RelayError::Dispatch(
            "message content must not be empty".to_string(),
        ));
    }

    let context = request
        .context
        .or_else(|| session.current_context())
        .unwrap_or_default();
    let room = resolve_room(&context);

    let message_id = MessageId::generate();
    let controller = StreamController::new(session.connection_id().clone(), message_id.clone());
    if let Some(previous) = session.replace_active_stream(controller.clone()) {
        if previous.interrupt() {
            debug!(
                superseded = %previous.message_id(),
                "New send superseded an in-flight stream"
            );
        }
    }
    // Checked after the controller is installed: a concurrent shutdown either
    // interrupts it or is observed here.
    if relay.is_shutting_down() {
        controller.interrupt();
        session.release_stream(&controller)?;
        return Err(RelayError::Dispatch("relay is shutting down".to_string()));
    }

    let user_message = Message::user(
        request.content.clone(),
        context.clone(),
        session.identity().as_str(),
    );
    relay.history.append(&room, user_message.clone()).await;
    relay
        .fan_out(
            &room,
            session,
            &controller,
            OutboundEvent::MessagePosted {
                message: user_message,
            },
        )
        .await;

    let span = info_span!(
        "relay.stream",
        connection_id = %session.connection_id(),
        message_id = %message_id,
        room = %room,
    );
    let job = StreamJob {
        relay: Arc::clone(relay),
        lease: StreamLease {
            session: session.clone(),
            controller,
        },
        room,
        request: GenerationRequest {
            message_id,
            content: request.content,
            context,
            identity: session.identity().as_str().to_string(),
        },
        include_thinking: request.include_thinking,
    };
    relay.tasks.spawn(job.run().instrument(span));
    Ok(())
}

/// Releases the controller from its session when the stream ends, whichever
/// way it ends.
struct StreamLease {
    session: Session,
    controller: StreamController,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if let Err(err) = self.session.release_stream(&self.controller) {
            error!(name: "relay.invariant", error = %err, "Stream controller release failed");
        }
    }
}

enum StreamOutcome {
    Completed { content: String, chunks: usize },
    Interrupted { chunks: usize },
}

struct StreamJob {
    relay: Arc<RelayShared>,
    lease: StreamLease,
    room: RoomId,
    request: GenerationRequest,
    include_thinking: bool,
}

impl StreamJob {
    async fn run(self) {
        match self.execute().await {
            Ok(StreamOutcome::Completed { chunks, .. }) if self.controller().is_interrupted() => {
                info!(
                    name: "relay.stream.interrupted",
                    chunks,
                    "Stream interrupted after its last chunk, not stored"
                );
            }
            Ok(StreamOutcome::Completed { content, chunks }) => {
                let message = Message::assistant(
                    self.request.message_id.clone(),
                    content,
                    self.request.context.clone(),
                );
                self.relay.history.append(&self.room, message).await;
                info!(name: "relay.stream.completed", chunks, "Stream completed");
            }
            Ok(StreamOutcome::Interrupted { chunks }) => {
                info!(name: "relay.stream.interrupted", chunks, "Stream stopped early");
            }
            Err(err) => {
                warn!(name: "relay.stream.failed", error = %err, "Stream failed");
                self.lease
                    .session
                    .emit(OutboundEvent::error(err.to_string()))
                    .await;
            }
        }
    }

    fn controller(&self) -> &StreamController {
        &self.lease.controller
    }

    async fn emit(&self, event: OutboundEvent) {
        self.relay
            .fan_out(&self.room, &self.lease.session, self.controller(), event)
            .await;
    }

    /// Wait at a boundary. Returns `false` if the stream was interrupted.
    async fn pause(&self, phase: PacePhase) -> bool {
        let controller = self.controller();
        tokio::select! {
            () = self.relay.pacer.pause(phase) => {}
            () = controller.cancelled() => {}
        }
        !controller.is_interrupted()
    }

    async fn execute(&self) -> Result<StreamOutcome> {
        let interrupted = || StreamOutcome::Interrupted { chunks: 0 };

        if self.include_thinking {
            let steps = self.relay.generator.thinking(&self.request).await?;
            for (index, step) in steps.into_iter().enumerate() {
                if index > 0 && !self.pause(PacePhase::Thinking).await {
                    return Ok(interrupted());
                }
                if self.controller().is_interrupted() {
                    return Ok(interrupted());
                }
                self.emit(OutboundEvent::ThinkingUpdate(step)).await;
            }
            if !self.pause(PacePhase::Thinking).await {
                return Ok(interrupted());
            }
        }

        if self.controller().is_interrupted() {
            return Ok(interrupted());
        }
        let body = self.relay.generator.generate(&self.request).await?;
        if self.controller().is_interrupted() {
            return Ok(interrupted());
        }

        let mut pieces = chunk_stream(body, self.relay.settings.chunk_size);
        // An empty response still ends with one (empty) final chunk.
        let mut pending = Some(pieces.next().await.transpose()?.unwrap_or_default());
        let mut delivered = String::new();
        let mut chunks = 0;

        while let Some(current) = pending.take() {
            if chunks > 0 && !self.pause(PacePhase::Chunk).await {
                return Ok(StreamOutcome::Interrupted { chunks });
            }
            let next = pieces.next().await.transpose()?;
            if self.controller().is_interrupted() {
                return Ok(StreamOutcome::Interrupted { chunks });
            }

            delivered.push_str(&current);
            self.emit(OutboundEvent::MessageChunk(MessageChunk {
                message_id: self.request.message_id.clone(),
                content: current,
                is_complete: next.is_none(),
            }))
            .await;
            chunks += 1;
            pending = next;
        }

        Ok(StreamOutcome::Completed {
            content: delivered,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_45_chars_by_20() {
        let text = "a".repeat(45);
        let pieces = split_chunks(&text, DEFAULT_CHUNK_SIZE);
        let lengths: Vec<_> = pieces.iter().map(String::len).collect();
        assert_eq!(lengths, vec![20, 20, 5]);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_split_respects_multibyte_chars() {
        let pieces = split_chunks("héllo wörld", 4);
        assert_eq!(pieces, vec!["héll", "o wö", "rld"]);
    }

    #[test]
    fn test_split_edge_cases() {
        assert!(split_chunks("", 20).is_empty());
        assert_eq!(split_chunks("abc", 0), vec!["a", "b", "c"]);
        assert_eq!(split_chunks("exactly twenty chars", 20).len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_stream_resplits_pieces() {
        let body = ResponseBody::Chunks(
            stream::iter(vec![Ok("abcdefg".to_string()), Ok("hi".to_string())]).boxed(),
        );
        let pieces: Vec<_> = chunk_stream(body, 3)
            .map(|p| p.unwrap())
            .collect()
            .await;
        assert_eq!(pieces, vec!["abc", "def", "g", "hi"]);
    }

    #[tokio::test]
    async fn test_chunk_stream_passes_errors_through() {
        let body = ResponseBody::Chunks(
            stream::iter(vec![
                Ok("ok".to_string()),
                Err(GeneratorError::Failed("cut off".into())),
            ])
            .boxed(),
        );
        let items: Vec<_> = chunk_stream(body, 20).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
