//! yc-watchdog - keeps a fixed set of Yandex Cloud VMs running.
//!
//! On startup the watchdog:
//! - Loads `.config.yml` (or `--config`), with `YC_WATCHDOG_*` overrides
//! - Verifies host commands and the `yc` CLI, installing them if missing
//! - Polls every configured VM and starts any that is not RUNNING/STARTING
//! - Repeats every `interval_secs` until SIGINT/SIGTERM
//!
//! ```
//! yc-watchdog --config /etc/yc-watchdog/config.yml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::signal;
use tracing::instrument::WithSubscriber;
use tracing::{error, info};
use yc_control::ControlPlane;

use yc_watchdog::bootstrap::RequirementsChecker;
use yc_watchdog::config::Config;
use yc_watchdog::logging;
use yc_watchdog::monitor::Monitor;

/// Watchdog restarting stopped Yandex Cloud VMs
#[derive(Parser, Debug)]
#[command(name = "yc-watchdog", version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Skip host and CLI requirement checks (yc is assumed to be installed)
    #[arg(long)]
    skip_bootstrap: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging depends on config, so config errors can only go to stderr
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let (dispatch, _guard) = logging::init(&config.log_path, config.log_level)?;

    async {
        let result = run(&args, &config).await;
        if let Err(ref e) = result {
            error!("{:#}", e);
        }
        result
    }
    .with_subscriber(dispatch)
    .await
}

async fn run(args: &Args, config: &Config) -> anyhow::Result<()> {
    info!("Running tool..");

    let binary = if args.skip_bootstrap {
        info!("Skipping requirements check");
        config.yc.binary.clone()
    } else {
        let bootstrapped = RequirementsChecker::check_with_retries(config).await?;
        info!("Using yc {}", bootstrapped.version);
        bootstrapped.binary
    };

    let control: Arc<dyn ControlPlane> = Arc::new(config.control_plane(binary));
    let monitor = Monitor::from_config(config, control)?;

    if args.once {
        let report = monitor.run_cycle().await;
        if report.failed_count() > 0 {
            bail!(
                "{} of {} VMs could not be checked or started",
                report.failed_count(),
                report.reports.len()
            );
        }
        return Ok(());
    }

    info!("Monitoring started for {} VMs..", monitor.vms().len());
    monitor.run_until(shutdown_signal()).await;
    info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
