//! Top-level accept → drain → handoff lifecycle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accept::{AcceptLoop, Serve};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handoff::{Handoff, HandoffSignal, ProcessHandoff};
use crate::lifecycle::{DrainReport, Lifecycle};

/// A server driving one listener through its full lifecycle.
pub struct Server<H> {
    config: Config,
    handoff: H,
    lifecycle: Lifecycle,
}

impl<H: Handoff> Server<H> {
    pub fn new(config: Config, handoff: H) -> Self {
        let lifecycle = Lifecycle::from_config(&config);
        Self {
            config,
            handoff,
            lifecycle,
        }
    }

    /// Handle for registering background tasks. Clone it into the service
    /// before calling [`Server::serve`].
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serve until a restart or terminate signal, then drain.
    ///
    /// 1. Acquire a listener (inherited or fresh)
    /// 2. Run the accept loop on its own task
    /// 3. Notify readiness and wait for a signal
    /// 4. Stop accepting and drain requests and tasks
    /// 5. On restart, re-exec with the listener; on terminate, return
    ///
    /// Fatal listener or serve errors end the lifecycle early and are
    /// returned; whether to abort the process is up to the caller.
    pub async fn serve<S: Serve>(mut self, service: S) -> Result<HandoffSignal> {
        self.config.log_config();

        let (listener, inherited) = self.handoff.acquire_listener(self.config.addr).await?;
        let listener = Arc::new(listener);

        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let accept = AcceptLoop::new(
            Arc::clone(&listener),
            service,
            self.lifecycle.clone(),
            self.config.timeouts(),
            fatal_tx,
        )?
        .with_poll_interval(self.config.poll_interval);
        let mut accept_task = tokio::spawn(accept.run());

        info!(inherited, "Serving");
        let signal = match self
            .await_handoff(&listener, &mut fatal_rx, &mut accept_task)
            .await
        {
            Ok(signal) => signal,
            Err(err) => {
                // Never leave the accept loop running behind an error.
                self.lifecycle.shutdown_signal().close();
                if !accept_task.is_finished() {
                    if let Err(e) = accept_task.await {
                        warn!(error = %e, "Accept loop task failed while stopping");
                    }
                }
                return Err(err);
            }
        };

        let report = self.lifecycle.shutdown().await;
        log_report(&report);

        match accept_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(Error::serve(format!("accept loop task failed: {e}"))),
        }
        if let Ok(err) = fatal_rx.try_recv() {
            return Err(err);
        }

        if signal == HandoffSignal::Restart {
            let listener = Arc::try_unwrap(listener)
                .map_err(|shared| Error::ListenerInUse(Arc::strong_count(&shared) - 1))?;
            info!("Drain finished, re-executing");
            self.handoff.re_exec(listener)?;
        }

        info!(signal = ?signal, "Lifecycle complete");
        Ok(signal)
    }

    /// Notify readiness, then wait for a handoff signal. Fatal serve errors
    /// and an accept loop that ends on its own cut the wait short.
    async fn await_handoff(
        &mut self,
        listener: &H::Listener,
        fatal_rx: &mut mpsc::Receiver<Error>,
        accept_task: &mut JoinHandle<Result<()>>,
    ) -> Result<HandoffSignal> {
        self.handoff.notify_ready(listener).await?;

        tokio::select! {
            signal = self.handoff.await_signal() => signal,
            Some(err) = fatal_rx.recv() => {
                error!(error = %err, "Stopping after fatal serve error");
                Err(err)
            }
            joined = &mut *accept_task => {
                // The loop only ends on its own if the listener closed or failed.
                match joined {
                    Ok(Ok(())) => Err(Error::ListenerClosed),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(Error::serve(format!("accept loop task failed: {e}"))),
                }
            }
        }
    }
}

fn log_report(report: &DrainReport) {
    if !report.is_clean() {
        warn!(
            requests = ?report.requests,
            tasks = ?report.tasks,
            "Some requests or tasks did not finish in the allowed period"
        );
    }
}

/// Serve `service` with signal-driven process handoff until terminated.
///
/// Convenience for services that do not register background tasks; use
/// [`Server`] directly to get at the [`Lifecycle`].
pub async fn serve<S: Serve>(config: Config, service: S) -> Result<HandoffSignal> {
    let handoff = ProcessHandoff::new()?;
    Server::new(config, handoff).serve(service).await
}
