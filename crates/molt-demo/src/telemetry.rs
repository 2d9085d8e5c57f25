//! Logging setup for the demo server.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,molt=debug,molt_demo=debug")
}

/// Initialize console logging.
///
/// Honors `RUST_LOG`, falling back to `info,molt=debug,molt_demo=debug`.
/// Every line carries the pid so old and new processes can be told apart
/// across a restart.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(pid = std::process::id(), "Logging initialized");
    Ok(())
}
