//! Logging setup (C12), grounded on `RactorLabs-ractor/src/shared/logging.rs`:
//! a layered `tracing-subscriber` with a daily-rotating file appender plus a
//! console layer, falling back to console-only when the log directory can't
//! be created.

use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for a long-lived `mngr-*` service binary.
///
/// `log_dir` typically lives under `$HOST_DIR` so logs sit next to the
/// agent/host records they describe.
pub fn init_service_logging(log_dir: &str, service_name: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let can_write_logs = std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(format!("{log_dir}/.write_test")))
        .map(|_| std::fs::remove_file(format!("{log_dir}/.write_test")))
        .is_ok();

    if can_write_logs {
        use tracing_appender::rolling;

        let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
        let (non_blocking_file, guard_file) = non_blocking(file_appender);
        let (non_blocking_stdout, guard_stdout) = non_blocking(std::io::stdout());

        let file_layer = fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let console_layer = fmt::layer()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .init();

        std::mem::forget(guard_file);
        std::mem::forget(guard_stdout);

        info!("logging initialized: {log_dir}/{service_name}.log");
    } else {
        let (non_blocking_stdout, guard_stdout) = non_blocking(std::io::stdout());
        let console_layer = fmt::layer()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        std::mem::forget(guard_stdout);
        info!("logging initialized: console only (could not write to {log_dir})");
    }

    Ok(())
}

/// Rename the previous run's log file aside so each run starts a fresh file,
/// matching `RactorLabs-ractor`'s startup log rotation.
pub fn rotate_logs_on_startup(log_dir: &str, service_name: &str) -> anyhow::Result<()> {
    let log_file = format!("{log_dir}/{service_name}.log");
    let log_path = Path::new(&log_file);
    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup = format!("{log_dir}/{service_name}.{timestamp}.log");
        std::fs::rename(&log_file, &backup)?;
    }
    Ok(())
}
