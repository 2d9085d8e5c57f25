//! Listener handoff between a process and its successor.
//!
//! The lifecycle core only talks to the [`Handoff`] trait. [`ProcessHandoff`]
//! implements it with Unix signals and fd inheritance:
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown (drain, then exit)
//! - `SIGQUIT`: graceful restart
//!
//! A restart keeps someone accepting the whole time. On `SIGQUIT` the
//! process starts a successor on the same listener and keeps serving. Once
//! the successor is ready it sends `SIGUSR2`, and only then does the
//! original stop accepting, drain and re-exec itself in place, keeping its
//! pid. The re-executed image stops the successor with `SIGTERM` as soon as
//! it is ready, and the successor drains and exits.
//!
//! The listener crosses `execve` at fd 3, announced through `LISTEN_FDS`
//! and `LISTEN_PID` (compatible with systemd socket activation).

mod exec;
mod inherit;

use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::process::Child;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::listener::Listener;

pub use exec::re_exec;
pub use inherit::inherit_listener;

/// Environment variable naming the process that started us as its
/// successor. It is sent `SIGUSR2` once we are ready.
pub const PREDECESSOR_PID_ENV: &str = "MOLT_PREDECESSOR_PID";

/// Environment variable naming the temporary successor that covered a
/// re-exec. It is sent `SIGTERM` once we are ready.
pub const SUCCESSOR_PID_ENV: &str = "MOLT_SUCCESSOR_PID";

/// Why the lifecycle is ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffSignal {
    /// Drain, then exit.
    Terminate,
    /// Drain, then re-exec passing the listener along.
    Restart,
}

/// Supplies the listener and the restart/terminate events.
pub trait Handoff: Send {
    type Listener: Listener;

    /// Obtain a listener, inherited from a predecessor or freshly bound to
    /// `addr`. The flag is `true` when inherited.
    fn acquire_listener(
        &mut self,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<(Self::Listener, bool)>> + Send;

    /// Announce that this process is serving.
    fn notify_ready(
        &mut self,
        listener: &Self::Listener,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Block until a restart or terminate request arrives.
    fn await_signal(&mut self) -> impl Future<Output = Result<HandoffSignal>> + Send;

    /// Replace the current process image, passing `listener` through.
    ///
    /// Does not return on success.
    fn re_exec(&mut self, listener: Self::Listener) -> Result<()>;
}

/// How often a re-executed process checks whether its temporary successor
/// has exited.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Signal-driven handoff for a real process.
pub struct ProcessHandoff {
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
    sigusr2: Signal,
    listener_fd: Option<RawFd>,
    successor: Option<Child>,
}

impl ProcessHandoff {
    /// Register signal handlers. Must be called inside a Tokio runtime,
    /// and early: until this runs, `SIGQUIT` and `SIGUSR2` still kill the
    /// process.
    pub fn new() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).map_err(Error::Signal)?,
            sigint: signal(SignalKind::interrupt()).map_err(Error::Signal)?,
            sigquit: signal(SignalKind::quit()).map_err(Error::Signal)?,
            sigusr2: signal(SignalKind::user_defined2()).map_err(Error::Signal)?,
            listener_fd: None,
            successor: None,
        })
    }

    /// Start a successor on our listener, unless one is already running.
    fn start_successor(&mut self) {
        if let Some(pid) = self.successor.as_ref().and_then(Child::id) {
            info!(successor = pid, "Restart already in progress");
            return;
        }
        let Some(fd) = self.listener_fd else {
            warn!("Restart requested before a listener was acquired");
            return;
        };
        match exec::spawn_successor(fd) {
            Ok(child) => {
                info!(successor = ?child.id(), "Successor started, serving until it is ready");
                self.successor = Some(child);
            }
            Err(e) => error!(error = %e, "Could not start successor, restart abandoned"),
        }
    }
}

/// Wait for the successor to exit, or forever if there is none.
async fn successor_exit(
    successor: &mut Option<Child>,
) -> std::io::Result<std::process::ExitStatus> {
    match successor {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// Read and clear a pid passed through the environment.
fn take_pid_env(name: &str) -> Result<Option<libc::pid_t>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    std::env::remove_var(name);
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| Error::Inherit(format!("{name}={raw:?} is not a pid")))
}

fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(Error::Signal(std::io::Error::last_os_error()));
    }
    Ok(())
}

impl Handoff for ProcessHandoff {
    type Listener = TcpListener;

    async fn acquire_listener(&mut self, addr: SocketAddr) -> Result<(TcpListener, bool)> {
        let (listener, inherited) = match inherit_listener()? {
            Some(listener) => {
                info!(addr = ?listener.local_addr().ok(), "Resuming on inherited listener");
                (listener, true)
            }
            None => {
                let listener = TcpListener::bind(addr).await?;
                info!(addr = ?listener.local_addr().ok(), "Listening");
                (listener, false)
            }
        };
        self.listener_fd = Some(listener.as_raw_fd());
        Ok((listener, inherited))
    }

    async fn notify_ready(&mut self, listener: &TcpListener) -> Result<()> {
        let addr = listener.local_addr().ok();
        info!(addr = ?addr, pid = std::process::id(), "Ready");

        if let Some(pid) = take_pid_env(PREDECESSOR_PID_ENV)? {
            send_signal(pid, libc::SIGUSR2)?;
            info!(predecessor = pid, "Told predecessor to drain and re-exec");
        }

        if let Some(pid) = take_pid_env(SUCCESSOR_PID_ENV)? {
            send_signal(pid, libc::SIGTERM)?;
            info!(successor = pid, "Told temporary successor to drain");
            // It is still our child across the exec, so reap it here.
            tokio::spawn(async move {
                let mut status = 0;
                // SAFETY: polls our own child; `status` outlives each call.
                while unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } == 0 {
                    tokio::time::sleep(REAP_INTERVAL).await;
                }
            });
        }
        Ok(())
    }

    async fn await_signal(&mut self) -> Result<HandoffSignal> {
        loop {
            tokio::select! {
                _ = self.sigterm.recv() => {
                    info!("Received SIGTERM, draining before exit");
                    return Ok(HandoffSignal::Terminate);
                }
                _ = self.sigint.recv() => {
                    info!("Received SIGINT, draining before exit");
                    return Ok(HandoffSignal::Terminate);
                }
                _ = self.sigquit.recv() => {
                    info!("Received SIGQUIT, starting successor");
                    self.start_successor();
                }
                _ = self.sigusr2.recv() => {
                    if self.successor.is_some() {
                        info!("Successor is ready, draining before re-exec");
                        return Ok(HandoffSignal::Restart);
                    }
                    debug!("Ignoring SIGUSR2 without a successor");
                }
                status = successor_exit(&mut self.successor) => {
                    warn!(status = ?status, "Successor exited before becoming ready");
                    self.successor = None;
                }
            }
        }
    }

    fn re_exec(&mut self, listener: TcpListener) -> Result<()> {
        let successor = self
            .successor
            .as_ref()
            .and_then(Child::id)
            .map(|pid| pid.to_string());
        let extra_env: Vec<(&str, &str)> = successor
            .as_deref()
            .map(|pid| (SUCCESSOR_PID_ENV, pid))
            .into_iter()
            .collect();
        re_exec(listener, &extra_env).map(|never| match never {})
    }
}
