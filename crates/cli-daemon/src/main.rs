//! CLI entry point for the Nitflex pipeline daemon
//!
//! Parses command line arguments, installs logging and runs the daemon.

use clap::Parser;
use nitflex_daemon::{Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Nitflex pipeline daemon - transcodes, tags and files uploaded media
#[derive(Parser, Debug)]
#[command(name = "nitflex-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (missing file = defaults)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, storage roots). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Number of job workers (overrides queue.workers)
    #[arg(short, long)]
    workers: Option<u32>,
}

async fn init_daemon(args: &Args) -> Result<Daemon, DaemonError> {
    let mut config = Config::load_or_default(&args.config)?;
    if let Some(workers) = args.workers {
        config.queue.workers = workers;
    }

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(config = %args.config.display(), "nitflex daemon starting");

    let daemon = match init_daemon(&args).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        workers = daemon.plan.workers,
        capacity = daemon.plan.capacity,
        "daemon initialized"
    );
    if daemon.config.server.enabled {
        info!(addr = %daemon.config.server.bind_addr, "status server enabled");
    }

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
