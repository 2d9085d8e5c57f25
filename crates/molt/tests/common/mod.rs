//! Shared helpers for lifecycle integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use molt::{Config, Error, Handoff, HandoffSignal, Lifecycle, Listener, Result, Serve};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Config bound to an ephemeral loopback port with short timings.
pub fn test_config() -> Config {
    Config {
        addr: "127.0.0.1:0".parse().unwrap(),
        request_grace_period: Duration::from_secs(5),
        task_grace_period: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
    }
}

/// Test side of a [`ScriptedHandoff`].
pub struct HandoffControl {
    pub ready: oneshot::Receiver<SocketAddr>,
    pub signals: mpsc::Sender<HandoffSignal>,
    pub re_execs: Arc<AtomicUsize>,
}

impl HandoffControl {
    pub async fn wait_ready(&mut self) -> SocketAddr {
        tokio::time::timeout(Duration::from_secs(5), &mut self.ready)
            .await
            .expect("server did not become ready")
            .expect("server dropped readiness channel")
    }

    pub async fn send(&self, signal: HandoffSignal) {
        self.signals.send(signal).await.unwrap();
    }
}

/// Handoff step a [`ScriptedHandoff`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    /// `notify_ready` reports the address, then fails.
    Ready,
    /// `await_signal` fails instead of waiting.
    Signal,
}

/// Handoff driven by the test instead of real signals and exec.
pub struct ScriptedHandoff {
    ready: Option<oneshot::Sender<SocketAddr>>,
    signals: mpsc::Receiver<HandoffSignal>,
    re_execs: Arc<AtomicUsize>,
    fail_at: Option<FailAt>,
}

impl ScriptedHandoff {
    pub fn failing_at(mut self, step: FailAt) -> Self {
        self.fail_at = Some(step);
        self
    }
}

pub fn scripted_handoff() -> (ScriptedHandoff, HandoffControl) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (signal_tx, signal_rx) = mpsc::channel(4);
    let re_execs = Arc::new(AtomicUsize::new(0));
    (
        ScriptedHandoff {
            ready: Some(ready_tx),
            signals: signal_rx,
            re_execs: Arc::clone(&re_execs),
            fail_at: None,
        },
        HandoffControl {
            ready: ready_rx,
            signals: signal_tx,
            re_execs,
        },
    )
}

impl Handoff for ScriptedHandoff {
    type Listener = TcpListener;

    async fn acquire_listener(&mut self, addr: SocketAddr) -> Result<(TcpListener, bool)> {
        Ok((TcpListener::bind(addr).await?, false))
    }

    async fn notify_ready(&mut self, listener: &TcpListener) -> Result<()> {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Listener::local_addr(listener)?);
        }
        if self.fail_at == Some(FailAt::Ready) {
            return Err(Error::serve("ready failed"));
        }
        Ok(())
    }

    async fn await_signal(&mut self) -> Result<HandoffSignal> {
        if self.fail_at == Some(FailAt::Signal) {
            return Err(Error::serve("signal failed"));
        }
        match self.signals.recv().await {
            Some(signal) => Ok(signal),
            None => std::future::pending().await,
        }
    }

    fn re_exec(&mut self, _listener: TcpListener) -> Result<()> {
        self.re_execs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Line protocol: `sleep <ms>` sleeps in the request, `spawn <ms>` sleeps
/// in a registered background task. Each command is answered with `done`.
#[derive(Clone)]
pub struct SleepService {
    pub lifecycle: Lifecycle,
}

impl Serve for SleepService {
    async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        loop {
            let (conn, _) = listener.accept().await?;
            let lifecycle = self.lifecycle.clone();
            tokio::spawn(async move {
                let mut conn = BufReader::new(conn);
                let mut line = String::new();
                if conn.read_line(&mut line).await.is_err() {
                    return;
                }
                let mut parts = line.split_whitespace();
                let command = parts.next().unwrap_or_default().to_string();
                let ms: u64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);

                match command.as_str() {
                    "spawn" => {
                        lifecycle.spawn_task(async move {
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                        });
                    }
                    _ => tokio::time::sleep(Duration::from_millis(ms)).await,
                }
                let _ = conn.get_mut().write_all(b"done\n").await;
            });
        }
    }
}

/// Send one command and return the reply line.
pub async fn request(addr: SocketAddr, command: &str) -> std::io::Result<String> {
    let stream = TcpStream::connect(addr).await?;
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(format!("{command}\n").as_bytes())
        .await?;
    let mut reply = String::new();
    stream.read_line(&mut reply).await?;
    Ok(reply)
}
