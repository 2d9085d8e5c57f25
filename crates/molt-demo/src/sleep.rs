//! `/sleep` endpoint, an axum router served over hyper one connection at a
//! time.
//!
//! - `GET /sleep?duration=<ms>` sleeps inside the request
//! - `GET /sleep?duration=<ms>&background=1` answers at once and sleeps in a
//!   background task that shutdown waits for

use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use molt::{Lifecycle, Listener, Serve};
use serde::Deserialize;
use tracing::{info, warn};

/// Query string of a `/sleep` request.
#[derive(Debug, Deserialize)]
pub struct SleepParams {
    /// Milliseconds to sleep.
    pub duration: u64,
    /// Any value other than empty or `0` moves the sleep to the background.
    pub background: Option<String>,
}

impl SleepParams {
    fn in_background(&self) -> bool {
        self.background
            .as_deref()
            .is_some_and(|v| !v.is_empty() && v != "0")
    }
}

/// Routes of the demo service.
pub fn router(lifecycle: Lifecycle) -> Router {
    Router::new()
        .route("/sleep", get(sleep_handler))
        .with_state(lifecycle)
}

async fn sleep_handler(
    State(lifecycle): State<Lifecycle>,
    Query(params): Query<SleepParams>,
) -> String {
    let pid = std::process::id();
    let duration = Duration::from_millis(params.duration);

    if params.in_background() {
        lifecycle.spawn_task(async move {
            info!(pid, ?duration, "Background task sleeping");
            tokio::time::sleep(duration).await;
            info!(pid, ?duration, "Background task slept");
        });
        return format!("pid: {pid} sleeping for {duration:?} in the background\n");
    }

    tokio::time::sleep(duration).await;
    format!("pid: {pid} slept for {duration:?}\n")
}

/// The demo service: every accepted connection is served by hyper with the
/// `/sleep` router.
#[derive(Clone)]
pub struct SleepService {
    router: Router,
}

impl SleepService {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self {
            router: router(lifecycle),
        }
    }
}

impl Serve for SleepService {
    async fn serve<L: Listener>(&self, listener: L) -> molt::Result<()> {
        loop {
            let (conn, peer) = listener.accept().await?;
            let service = TowerToHyperService::new(self.router.clone());
            tokio::spawn(async move {
                // One request per connection, so the request census sees
                // the connection close when the response is done.
                let served = http1::Builder::new()
                    .keep_alive(false)
                    .serve_connection(TokioIo::new(conn), service)
                    .await;
                if let Err(e) = served {
                    warn!(error = %e, peer = %peer, "Connection failed");
                }
            });
        }
    }
}
