//! pm2-watchdog
//!
//! Supervises the web endpoints of PM2 processes and restarts a process once
//! its endpoint keeps failing.
//!
//! Usage:
//!   pm2-watchdog [--config <path>] [--pm2-bin <path>] [--verbose] [--json-logs]
//!
//! Runs until Ctrl-C, then stops every watchdog.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use pm2_watchdog::config::ModuleConfig;
use pm2_watchdog::logging::{LogFormat, LogLevel, LoggingSystem};
use pm2_watchdog::process::Pm2Cli;
use pm2_watchdog::watchdog::HttpProbe;

/// Command line arguments
#[derive(clap::Parser, Debug)]
#[command(name = "pm2-watchdog")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HTTP health watchdog for PM2 processes", long_about = None)]
struct Args {
    /// Configuration file (JSON, TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// pm2 executable, overrides the configuration
    #[arg(long)]
    pm2_bin: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ModuleConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bin) = args.pm2_bin {
        config.pm2.bin = bin;
    }

    let mut logging = config.logging.clone();
    if config.debug {
        logging.level = logging.level.most_verbose(LogLevel::Trace);
    } else if args.verbose {
        logging.level = logging.level.most_verbose(LogLevel::Debug);
    }
    if args.json_logs {
        logging.format = LogFormat::Json;
    }
    let _logging = LoggingSystem::init(logging).context("initializing logging")?;

    tracing::trace!("Module is starting");

    let process_manager = Arc::new(Pm2Cli::new(&config.pm2));
    let probe = Arc::new(HttpProbe::new().context("building HTTP client")?);
    let config = Arc::new(config);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to setup signal handler: {}", e);
        }
        tracing::info!("Shutting down gracefully...");
        signal.cancel();
    });

    pm2_watchdog::serve(process_manager, probe, config, shutdown)
        .await
        .context("supervising PM2 processes")?;

    Ok(())
}
