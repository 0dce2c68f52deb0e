//! `mngr-enforced`: the background enforcement loop (spec §4.6).
//!
//! Calls [`mngr::facade::Facade::enforce`] on a fixed interval against every
//! configured provider instance, logging violations and the actions taken.
//! Shaped after `RactorLabs-ractor`'s per-service binary (`clap::Parser` + a
//! single `#[tokio::main]` loop) rather than its own supervisor, since no
//! module there runs a standalone interval-driven sweep.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use mngr::config::MngrConfig;
use mngr::engine::EnforceParams;
use mngr::facade::Facade;
use mngr::logging;

#[derive(Parser)]
#[command(name = "mngr-enforced")]
#[command(about = "Background idle/timeout enforcement sweep for mngr-managed agents")]
struct Args {
    /// Root directory holding provider state, auth, and logs.
    #[arg(long, env = "MNGR_HOST_DIR")]
    host_dir: Option<String>,

    /// Seconds between enforcement sweeps.
    #[arg(long, env = "MNGR_ENFORCE_INTERVAL_SECS", default_value_t = 60)]
    interval_secs: u64,

    /// Idle timeout (seconds) past which a non-local host is stopped.
    #[arg(long, env = "MNGR_IDLE_TIMEOUT_SECS", default_value_t = 3600)]
    idle_timeout_secs: u64,

    /// Max time (seconds) a host may spend BUILDING before it is flagged.
    #[arg(long, env = "MNGR_BUILDING_TIMEOUT_SECS", default_value_t = 900)]
    building_timeout_seconds: u64,

    /// Max time (seconds) a host may spend STARTING before it is flagged.
    #[arg(long, env = "MNGR_STARTING_TIMEOUT_SECS", default_value_t = 300)]
    starting_timeout_seconds: u64,

    /// Max time (seconds) a host may spend STOPPING before it is flagged.
    #[arg(long, env = "MNGR_STOPPING_TIMEOUT_SECS", default_value_t = 300)]
    stopping_timeout_seconds: u64,

    /// Report violations without performing the corresponding action.
    #[arg(long, env = "MNGR_ENFORCE_DRY_RUN")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, _config_path) = MngrConfig::load_default()?;
    let host_dir = args
        .host_dir
        .map(std::path::PathBuf::from)
        .unwrap_or(config.default_host_dir.clone());

    let _ = logging::rotate_logs_on_startup(&host_dir.join("logs").to_string_lossy(), "mngr_enforced");
    logging::init_service_logging(&host_dir.join("logs").to_string_lossy(), "mngr_enforced")
        .context("failed to initialize logging")?;

    let facade = Facade::from_config(config, host_dir).context("failed to build facade from config")?;

    let params = EnforceParams {
        check_idle: true,
        check_timeouts: true,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        building_timeout: Duration::from_secs(args.building_timeout_seconds),
        starting_timeout: Duration::from_secs(args.starting_timeout_seconds),
        stopping_timeout: Duration::from_secs(args.stopping_timeout_seconds),
        dry_run: args.dry_run,
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs));
    tracing::info!(
        interval_secs = args.interval_secs,
        idle_timeout_secs = args.idle_timeout_secs,
        building_timeout_seconds = args.building_timeout_seconds,
        starting_timeout_seconds = args.starting_timeout_seconds,
        stopping_timeout_seconds = args.stopping_timeout_seconds,
        dry_run = args.dry_run,
        "mngr-enforced starting sweep loop"
    );

    loop {
        ticker.tick().await;
        let result = facade.enforce(None, params.clone()).await;
        if !result.errors.is_empty() {
            for error in &result.errors {
                tracing::warn!("enforcement error: {error}");
            }
        }
        if !result.idle_violations.is_empty() || !result.timeout_violations.is_empty() || !result.actions.is_empty() {
            tracing::info!(
                hosts_checked = result.hosts_checked,
                idle_violations = result.idle_violations.len(),
                timeout_violations = result.timeout_violations.len(),
                actions = ?result.actions,
                "enforcement sweep found violations"
            );
        } else {
            tracing::debug!(hosts_checked = result.hosts_checked, "enforcement sweep clean");
        }
    }
}
