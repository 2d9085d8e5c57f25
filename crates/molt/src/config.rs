//! Server configuration.
//!
//! # Environment Variables
//!
//! - `MOLT_ADDR`: Listen address. Default: `0.0.0.0:8080`
//! - `MOLT_REQUEST_GRACE_SECS`: Request drain grace period, `0` = wait forever. Default: 30
//! - `MOLT_TASK_GRACE_SECS`: Background task grace period, `0` = wait forever. Default: 30
//! - `MOLT_READ_TIMEOUT_SECS`: Per-read connection timeout, `0` = disabled. Default: 30
//! - `MOLT_WRITE_TIMEOUT_SECS`: Per-write connection timeout, `0` = disabled. Default: 30

use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;

use crate::accept::DEFAULT_POLL_INTERVAL;
use crate::counter::GracePeriod;
use crate::error::{Error, Result};
use crate::timeout::Timeouts;

/// Default listen address: any interface, port 8080.
pub const DEFAULT_ADDR: SocketAddr =
    SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 8080));

/// Lifecycle configuration. Immutable once the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address to bind when no listener is inherited.
    pub addr: SocketAddr,
    /// How long to wait for in-flight requests. Zero waits forever.
    pub request_grace_period: Duration,
    /// How long to wait for background tasks. Zero waits forever.
    pub task_grace_period: Duration,
    /// Per-read timeout on accepted connections. Zero disables it.
    pub read_timeout: Duration,
    /// Per-write timeout on accepted connections. Zero disables it.
    pub write_timeout: Duration,
    /// Upper bound on shutdown detection lag in the accept loop.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR,
            request_grace_period: Duration::from_secs(30),
            task_grace_period: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Config {
    /// Load configuration from `MOLT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("MOLT_ADDR") {
            config.addr = addr
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("MOLT_ADDR={addr:?}: {e}")))?;
        }

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| Error::config(format!("{key}={raw:?}: {e}"))),
                None => Ok(default),
            }
        };

        config.request_grace_period = secs("MOLT_REQUEST_GRACE_SECS", config.request_grace_period)?;
        config.task_grace_period = secs("MOLT_TASK_GRACE_SECS", config.task_grace_period)?;
        config.read_timeout = secs("MOLT_READ_TIMEOUT_SECS", config.read_timeout)?;
        config.write_timeout = secs("MOLT_WRITE_TIMEOUT_SECS", config.write_timeout)?;

        Ok(config)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: self.read_timeout,
            write: self.write_timeout,
        }
    }

    pub fn request_grace(&self) -> GracePeriod {
        self.request_grace_period.into()
    }

    pub fn task_grace(&self) -> GracePeriod {
        self.task_grace_period.into()
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            addr = %self.addr,
            request_grace = %self.request_grace(),
            task_grace = %self.task_grace(),
            read_timeout = ?self.read_timeout,
            write_timeout = ?self.write_timeout,
            poll_interval = ?self.poll_interval,
            "Lifecycle configuration"
        );
    }
}
