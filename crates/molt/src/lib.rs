//! # molt
//!
//! Zero-downtime restarts and graceful shutdown for TCP services.
//!
//! ## Overview
//!
//! A running process keeps its listening socket open across restarts:
//! 1. The accept loop polls the listener in short slices so it notices a
//!    shutdown request within one poll interval
//! 2. Each accepted connection gets read/write deadlines and is served on
//!    its own task through a single-use listener
//! 3. On restart or terminate, accepting stops and in-flight requests and
//!    registered background tasks drain, each with its own grace period
//! 4. On restart a successor takes over the listener first, so someone is
//!    always accepting while the old process drains and re-execs itself
//!
//! ## Example
//!
//! ```rust,ignore
//! use molt::{Config, Listener, Serve};
//!
//! #[derive(Clone)]
//! struct Hello;
//!
//! impl Serve for Hello {
//!     async fn serve<L: Listener>(&self, listener: L) -> molt::Result<()> {
//!         loop {
//!             let (conn, _peer) = listener.accept().await?;
//!             tokio::spawn(handle(conn));
//!         }
//!     }
//! }
//!
//! let signal = molt::serve(Config::from_env()?, Hello).await?;
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

mod accept;
mod config;
mod counter;
mod error;
pub mod handoff;
mod lifecycle;
mod listener;
mod server;
mod signal;
mod timeout;

pub use accept::{AcceptLoop, Serve, ServedConnection, DEFAULT_POLL_INTERVAL};
pub use config::{Config, DEFAULT_ADDR};
pub use counter::{DrainOutcome, GracePeriod, WorkCounter, WorkGuard};
pub use error::{Error, Result};
pub use handoff::{Handoff, HandoffSignal, ProcessHandoff};
pub use lifecycle::{DrainReport, Lifecycle};
pub use listener::{Connection, Listener, SingleUseListener};
pub use server::{serve, Server};
pub use signal::ShutdownSignal;
pub use timeout::{TimeoutStream, Timeouts};
