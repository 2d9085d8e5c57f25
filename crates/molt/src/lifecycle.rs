//! Lifecycle coordinator: shutdown latch plus drain tracking.
//!
//! Three pools are tracked independently:
//! - running accept loops (drained without a deadline, they stop within
//!   one poll interval of the latch closing)
//! - in-flight requests, one per accepted connection
//! - detached background tasks registered with [`Lifecycle::begin_task`]
//!
//! Shutdown closes the latch, waits for the accept loops, then drains
//! requests and tasks concurrently, each against its own grace period.
//! Expiry is reported, never enforced: remaining work is not cancelled.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::counter::{DrainOutcome, GracePeriod, WorkCounter, WorkGuard};
use crate::signal::ShutdownSignal;

/// Result of draining requests and background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub requests: DrainOutcome,
    pub tasks: DrainOutcome,
}

impl DrainReport {
    /// Whether both pools emptied within their grace periods.
    pub fn is_clean(&self) -> bool {
        self.requests.is_drained() && self.tasks.is_drained()
    }
}

struct Inner {
    shutdown: ShutdownSignal,
    accept_loops: WorkCounter,
    requests: WorkCounter,
    tasks: WorkCounter,
    request_grace: GracePeriod,
    task_grace: GracePeriod,
}

/// Coordinator for graceful shutdown with request and task draining.
///
/// Cheap to clone; clones share the same pools and latch. Pass a clone to
/// request handlers that need to register background work.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("shutdown", &self.inner.shutdown.is_closed())
            .field("accept_loops", &self.running_accept_loops())
            .field("requests", &self.active_requests())
            .field("tasks", &self.active_tasks())
            .finish()
    }
}

impl Lifecycle {
    pub fn new(request_grace: GracePeriod, task_grace: GracePeriod) -> Self {
        Self {
            inner: Arc::new(Inner {
                shutdown: ShutdownSignal::new(),
                accept_loops: WorkCounter::new(),
                requests: WorkCounter::new(),
                tasks: WorkCounter::new(),
                request_grace,
                task_grace,
            }),
        }
    }

    /// Create with the grace periods from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.request_grace(), config.task_grace())
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.inner.shutdown
    }

    /// Register background work spawned outside the request path.
    ///
    /// Keep the guard alive for as long as the work runs; dropping it ends
    /// the task on every exit path, including panics and early returns.
    pub fn begin_task(&self) -> WorkGuard {
        self.inner.tasks.add()
    }

    /// Spawn `future` as registered background work.
    pub fn spawn_task<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.begin_task();
        tokio::spawn(async move {
            let output = future.await;
            drop(guard);
            output
        })
    }

    pub(crate) fn begin_request(&self) -> WorkGuard {
        self.inner.requests.add()
    }

    pub(crate) fn begin_accept_loop(&self) -> WorkGuard {
        self.inner.accept_loops.add()
    }

    pub fn requests(&self) -> &WorkCounter {
        &self.inner.requests
    }

    pub fn tasks(&self) -> &WorkCounter {
        &self.inner.tasks
    }

    pub fn active_requests(&self) -> usize {
        self.inner.requests.count()
    }

    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.count()
    }

    pub fn running_accept_loops(&self) -> usize {
        self.inner.accept_loops.count()
    }

    /// Run the shutdown sequence.
    ///
    /// 1. Close the shutdown latch
    /// 2. Wait for accept loops to stop
    /// 3. Drain requests and tasks concurrently, each bounded by its grace
    ///    period
    ///
    /// Returns once both drains finished or expired.
    pub async fn shutdown(&self) -> DrainReport {
        info!("Stopping accept loops");
        self.inner.shutdown.close();
        self.inner.accept_loops.wait_idle().await;

        info!(
            active_requests = self.active_requests(),
            active_tasks = self.active_tasks(),
            request_grace = %self.inner.request_grace,
            task_grace = %self.inner.task_grace,
            "Draining"
        );

        let (requests, tasks) = tokio::join!(
            drain_pool(&self.inner.requests, self.inner.request_grace, "requests"),
            drain_pool(&self.inner.tasks, self.inner.task_grace, "tasks"),
        );

        let report = DrainReport { requests, tasks };
        if report.is_clean() {
            info!("All requests and tasks drained cleanly");
        }
        report
    }
}

async fn drain_pool(counter: &WorkCounter, grace: GracePeriod, pool: &'static str) -> DrainOutcome {
    let outcome = counter.drain(grace).await;
    match outcome {
        DrainOutcome::Drained => info!(pool, "Pool drained"),
        DrainOutcome::Expired { remaining } => warn!(
            pool,
            remaining,
            grace = %grace,
            "Grace period expired before pool drained, proceeding anyway"
        ),
    }
    outcome
}
