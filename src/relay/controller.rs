//! Cooperative cancellation token for one in-flight streamed response.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::events::MessageId;
use crate::relay::session::ConnectionId;

/// Interruption flag shared between a session and its streaming task.
///
/// The flag moves from `false` to `true` at most once. The streaming task
/// polls it at every step boundary and can also await [`cancelled`] to wake
/// out of a pacing pause.
///
/// [`cancelled`]: StreamController::cancelled
#[derive(Debug, Clone)]
pub struct StreamController {
    inner: Arc<ControllerInner>,
}

#[derive(Debug)]
struct ControllerInner {
    owner: ConnectionId,
    message_id: MessageId,
    interrupted: AtomicBool,
    released: AtomicBool,
    wake: CancellationToken,
}

impl StreamController {
    #[must_use]
    pub fn new(owner: ConnectionId, message_id: MessageId) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                owner,
                message_id,
                interrupted: AtomicBool::new(false),
                released: AtomicBool::new(false),
                wake: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &ConnectionId {
        &self.inner.owner
    }

    /// Id of the response this controller governs.
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.inner.message_id
    }

    /// Set the interrupted flag.
    ///
    /// Returns `true` only for the call that flipped it.
    pub fn interrupt(&self) -> bool {
        let flipped = self
            .inner
            .interrupted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.inner.wake.cancel();
        flipped
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Resolves once the controller is interrupted.
    pub async fn cancelled(&self) {
        self.inner.wake.cancelled().await;
    }

    /// Record that the owning session let go of this controller.
    ///
    /// Returns `false` if it was already released.
    pub(crate) fn mark_released(&self) -> bool {
        !self.inner.released.swap(true, Ordering::AcqRel)
    }

    /// Whether two handles refer to the same controller.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> StreamController {
        StreamController::new(ConnectionId::new(), MessageId::generate())
    }

    #[test]
    fn test_interrupt_flips_once() {
        let c = controller();
        assert!(!c.is_interrupted());
        assert!(c.interrupt());
        assert!(c.is_interrupted());
        assert!(!c.interrupt());
        assert!(c.is_interrupted());
    }

    #[test]
    fn test_clones_share_flag() {
        let c = controller();
        let other = c.clone();
        other.interrupt();
        assert!(c.is_interrupted());
        assert!(c.same_as(&other));
        assert!(!c.same_as(&controller()));
    }

    #[test]
    fn test_release_is_single_shot() {
        let c = controller();
        assert!(c.mark_released());
        assert!(!c.mark_released());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let c = controller();
        let waiter = c.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        c.interrupt();
        handle.await.unwrap();
    }
}
