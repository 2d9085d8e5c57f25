//! Drain tracking for pools of outstanding work.
//!
//! A [`WorkCounter`] counts live [`WorkGuard`]s. Creating a guard is `add`,
//! dropping it is `done`, so the count can never go negative and the
//! decrement happens on every exit path of whatever holds the guard.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Maximum time to wait for a pool to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracePeriod {
    /// Wait until the pool is empty, however long that takes.
    Infinite,
    /// Give up after the duration elapses.
    Bounded(Duration),
}

impl From<Duration> for GracePeriod {
    /// A zero duration means "wait indefinitely".
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            GracePeriod::Infinite
        } else {
            GracePeriod::Bounded(duration)
        }
    }
}

impl fmt::Display for GracePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GracePeriod::Infinite => write!(f, "infinite"),
            GracePeriod::Bounded(d) => write!(f, "{:?}", d),
        }
    }
}

/// How a drain wait finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The pool reached zero.
    Drained,
    /// The grace period elapsed with work still outstanding.
    Expired { remaining: usize },
}

impl DrainOutcome {
    pub fn is_drained(&self) -> bool {
        matches!(self, DrainOutcome::Drained)
    }
}

struct Shared {
    count: AtomicUsize,
    idle: Notify,
}

/// Reference-counted census of outstanding work units.
#[derive(Clone)]
pub struct WorkCounter {
    shared: Arc<Shared>,
}

impl Default for WorkCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkCounter")
            .field("count", &self.count())
            .finish()
    }
}

impl WorkCounter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Register one unit of work. The unit is done when the guard drops.
    pub fn add(&self) -> WorkGuard {
        self.shared.count.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current number of outstanding units.
    pub fn count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Wait until the count reaches zero.
    pub async fn wait_idle(&self) {
        loop {
            // Register interest before checking so a drop between the
            // check and the await cannot be missed.
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the count to reach zero, bounded by `grace`.
    pub async fn drain(&self, grace: GracePeriod) -> DrainOutcome {
        match grace {
            GracePeriod::Infinite => {
                self.wait_idle().await;
                DrainOutcome::Drained
            }
            GracePeriod::Bounded(limit) => {
                match tokio::time::timeout(limit, self.wait_idle()).await {
                    Ok(()) => DrainOutcome::Drained,
                    Err(_) => DrainOutcome::Expired {
                        remaining: self.count(),
                    },
                }
            }
        }
    }
}

/// One outstanding unit of work in a [`WorkCounter`].
#[must_use = "the unit of work completes as soon as the guard is dropped"]
pub struct WorkGuard {
    shared: Arc<Shared>,
}

impl WorkGuard {
    /// Mark the unit as done. Equivalent to dropping the guard.
    pub fn done(self) {}
}

impl fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let prev = self.shared.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}
