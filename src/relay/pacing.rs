//! Pacing policies for streamed output.
//!
//! The streaming loop pauses between thinking steps and between chunks. How
//! long it pauses is up to the [`Pacer`], so tests can run with no delay.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::RelaySettings;

/// Which boundary the stream is pausing at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacePhase {
    /// Between two thinking updates, or after the last one.
    Thinking,
    /// Between two content chunks.
    Chunk,
}

/// Decides how long a stream waits at each boundary.
///
/// The caller races the pause against interruption, so implementations may
/// block for as long as they like.
#[async_trait]
pub trait Pacer: Send + Sync + std::fmt::Debug {
    async fn pause(&self, phase: PacePhase);
}

/// No delay; only yields to the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

#[async_trait]
impl Pacer for Immediate {
    async fn pause(&self, _phase: PacePhase) {
        tokio::task::yield_now().await;
    }
}

/// Fixed wall-clock delay per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalPacer {
    pub thinking: Duration,
    pub chunk: Duration,
}

impl IntervalPacer {
    #[must_use]
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            thinking: Duration::from_millis(settings.thinking_interval_ms),
            chunk: Duration::from_millis(settings.chunk_interval_ms),
        }
    }
}

#[async_trait]
impl Pacer for IntervalPacer {
    async fn pause(&self, phase: PacePhase) {
        let delay = match phase {
            PacePhase::Thinking => self.thinking,
            PacePhase::Chunk => self.chunk,
        };
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
