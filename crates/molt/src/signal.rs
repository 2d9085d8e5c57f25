//! One-shot shutdown latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Broadcast latch that transitions from open to closed exactly once.
///
/// Clones share the same state. Any task may observe it; closing is
/// idempotent and every read after the first close sees it closed.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    // Only decides which `close` call reports the transition.
    first_close: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the latch.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let first = !self.first_close.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the latch is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}
