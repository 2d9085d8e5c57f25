//! The bounded-poll accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, Instrument};

use crate::counter::WorkGuard;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::listener::{Connection, Listener, SingleUseListener};
use crate::signal::ShutdownSignal;
use crate::timeout::{TimeoutStream, Timeouts};

/// Longest time the accept loop can go without rechecking for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A connection-oriented serve routine.
///
/// Implementations loop on [`Listener::accept`] and return when it fails.
/// The accept loop hands each connection to `serve` through a
/// [`SingleUseListener`], so a well-behaved implementation returns
/// [`Error::Exhausted`] once the connection has been taken. Any other error
/// is treated as fatal for the whole server.
pub trait Serve: Clone + Send + Sync + 'static {
    fn serve<L: Listener>(&self, listener: L) -> impl Future<Output = Result<()>> + Send;
}

/// Stream type handed to a [`Serve`] implementation by the accept loop.
pub type ServedConnection<L> = Connection<TimeoutStream<<L as Listener>::Io>>;

/// Accepts connections until shutdown and dispatches each one to a
/// [`Serve`] implementation on its own task.
pub struct AcceptLoop<L, S> {
    listener: Arc<L>,
    local_addr: SocketAddr,
    service: S,
    lifecycle: Lifecycle,
    shutdown: ShutdownSignal,
    timeouts: Timeouts,
    poll_interval: Duration,
    fatal: mpsc::Sender<Error>,
    _running: WorkGuard,
}

impl<L: Listener, S: Serve> AcceptLoop<L, S> {
    /// Create the loop. It counts as running in `lifecycle` from this
    /// point until [`AcceptLoop::run`] returns or the loop is dropped.
    ///
    /// Fatal errors from connection tasks are reported on `fatal`.
    pub fn new(
        listener: Arc<L>,
        service: S,
        lifecycle: Lifecycle,
        timeouts: Timeouts,
        fatal: mpsc::Sender<Error>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            service,
            shutdown: lifecycle.shutdown_signal().clone(),
            _running: lifecycle.begin_accept_loop(),
            lifecycle,
            timeouts,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fatal,
        })
    }

    /// Override the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until shutdown is signalled or the listener is closed.
    ///
    /// Returns an error only for fatal listener failures.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr, "Accept loop running");

        loop {
            if self.shutdown.is_closed() {
                info!(addr = %self.local_addr, "Accept loop stopped (shutdown)");
                return Ok(());
            }

            let accepted =
                tokio::time::timeout(self.poll_interval, self.listener.accept()).await;

            match accepted {
                Err(_elapsed) => continue,
                Ok(Ok((io, peer))) => self.dispatch(io, peer),
                Ok(Err(e)) if e.is_retryable_accept() => {
                    debug!(addr = %self.local_addr, error = %e, "Retrying accept");
                    continue;
                }
                Ok(Err(Error::ListenerClosed)) => {
                    info!(addr = %self.local_addr, "Accept loop stopped (listener closed)");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    error!(addr = %self.local_addr, error = %e, "Fatal accept error");
                    return Err(e);
                }
            }
        }
    }

    fn dispatch(&self, io: L::Io, peer: SocketAddr) {
        // Counted before the task exists, released when the handler drops
        // the connection.
        let request = self.lifecycle.begin_request();
        let conn: ServedConnection<L> =
            Connection::new(TimeoutStream::new(io, self.timeouts), peer, request);
        let listener = SingleUseListener::new(conn, self.local_addr);

        let service = self.service.clone();
        let fatal = self.fatal.clone();

        tokio::spawn(
            async move {
                debug!("Serving connection");
                match service.serve(listener).await {
                    Ok(()) | Err(Error::Exhausted) => {}
                    Err(e) => {
                        error!(error = %e, "Fatal serve error");
                        // First fatal error wins; later ones are already moot.
                        let _ = fatal.try_send(e);
                    }
                }
            }
            .instrument(info_span!("molt.connection", peer = %peer)),
        );
    }
}
