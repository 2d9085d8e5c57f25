use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use molt::{Config, ProcessHandoff, Server};
use tracing::{error, info};

mod sleep;
mod telemetry;

/// Sleep server that restarts on SIGQUIT and drains on SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "molt-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address (overrides MOLT_ADDR)
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Request grace period in seconds, 0 waits forever (overrides MOLT_REQUEST_GRACE_SECS)
    #[arg(long)]
    request_grace_secs: Option<u64>,

    /// Background task grace period in seconds, 0 waits forever (overrides MOLT_TASK_GRACE_SECS)
    #[arg(long)]
    task_grace_secs: Option<u64>,

    /// Per-read timeout in seconds, 0 disables it (overrides MOLT_READ_TIMEOUT_SECS)
    #[arg(long)]
    read_timeout_secs: Option<u64>,

    /// Per-write timeout in seconds, 0 disables it (overrides MOLT_WRITE_TIMEOUT_SECS)
    #[arg(long)]
    write_timeout_secs: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(secs) = self.request_grace_secs {
            config.request_grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = self.task_grace_secs {
            config.task_grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.write_timeout_secs {
            config.write_timeout = Duration::from_secs(secs);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    info!("molt demo starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Register signal handlers before anything else can be interrupted.
    let handoff = ProcessHandoff::new()?;

    let mut config = Config::from_env()?;
    cli.apply(&mut config);

    let server = Server::new(config, handoff);
    let service = sleep::SleepService::new(server.lifecycle().clone());

    match server.serve(service).await {
        Ok(signal) => {
            info!(signal = ?signal, "Exiting");
            Ok(())
        }
        Err(e) => {
            // Listener-level failures are not recoverable in-process.
            error!(error = %e, "Fatal server error, aborting");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "molt-demo",
            "--addr",
            "127.0.0.1:9999",
            "--request-grace-secs",
            "0",
            "--write-timeout-secs",
            "3",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.request_grace_period, Duration::ZERO);
        assert_eq!(config.task_grace_period, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::parse_from(["molt-demo"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config, Config::default());
    }
}
