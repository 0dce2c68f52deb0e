//! `mngr-attach`: the interactive attach wrapper (spec §4.6/§6).
//!
//! Bound to a multiplexer session's Ctrl-Q / Ctrl-T key bindings, this
//! process writes `activity/ssh` every 5 s while attached and watches
//! `signals/<session>` for a `"stop"` or `"destroy"` line written by those
//! bindings. On detach it exits with code 10 (destroy) or 11 (stop) so the
//! local engine can perform the matching façade call; a plain Ctrl-D or
//! connection drop exits 0 and leaves the agent running untouched.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use mngr::logging;

const DESTROY_EXIT_CODE: i32 = 10;
const STOP_EXIT_CODE: i32 = 11;
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "mngr-attach")]
#[command(about = "Activity heartbeat and detach-signal wrapper for attached agent sessions")]
struct Args {
    /// Root directory holding `agents/<id>/activity/` and `signals/`.
    #[arg(long, env = "MNGR_HOST_DIR")]
    host_dir: String,

    /// Agent id this attach session belongs to.
    #[arg(long, env = "MNGR_AGENT_ID")]
    agent_id: String,

    /// Multiplexer session name whose signal file this wrapper watches.
    #[arg(long, env = "MNGR_SESSION_NAME")]
    session_name: String,
}

#[derive(Serialize)]
struct ActivityHeartbeat {
    time: chrono::DateTime<chrono::Utc>,
    ssh_pid: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let host_dir = PathBuf::from(&args.host_dir);

    let _ = logging::init_service_logging(&host_dir.join("logs").to_string_lossy(), "mngr_attach");

    let activity_path = host_dir
        .join("agents")
        .join(&args.agent_id)
        .join("activity")
        .join("ssh");
    let signal_path = host_dir.join("signals").join(&args.session_name);

    if let Some(parent) = activity_path.parent() {
        tokio::fs::create_dir_all(parent).await.context("creating activity directory")?;
    }
    if let Some(parent) = signal_path.parent() {
        tokio::fs::create_dir_all(parent).await.context("creating signals directory")?;
    }

    let pid = std::process::id();
    let mut heartbeat = tokio::time::interval(ACTIVITY_INTERVAL);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = write_heartbeat(&activity_path, pid).await {
                    tracing::warn!("failed to write activity heartbeat: {e}");
                }
            }
            signal = poll_signal(&signal_path) => {
                match signal {
                    Signal::Destroy => {
                        tracing::info!("detach signal: destroy");
                        std::process::exit(DESTROY_EXIT_CODE);
                    }
                    Signal::Stop => {
                        tracing::info!("detach signal: stop");
                        std::process::exit(STOP_EXIT_CODE);
                    }
                }
            }
        }
    }
}

async fn write_heartbeat(activity_path: &std::path::Path, pid: u32) -> anyhow::Result<()> {
    let heartbeat = ActivityHeartbeat {
        time: chrono::Utc::now(),
        ssh_pid: pid,
    };
    let bytes = serde_json::to_vec(&heartbeat)?;
    let tmp = activity_path.with_extension(format!("tmp-{}", mngr::primitives::random_suffix()));
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, activity_path).await?;
    Ok(())
}

enum Signal {
    Stop,
    Destroy,
}

/// Polls for the signal file every 200ms. Reads and removes it atomically
/// via rename to a scratch path so a concurrent writer never races a reader
/// that only partially consumed the file.
async fn poll_signal(signal_path: &std::path::Path) -> Signal {
    loop {
        if let Some(signal) = try_consume_signal(signal_path).await {
            return signal;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn try_consume_signal(signal_path: &std::path::Path) -> Option<Signal> {
    if !tokio::fs::try_exists(signal_path).await.unwrap_or(false) {
        return None;
    }
    let scratch = signal_path.with_extension(format!("consuming-{}", mngr::primitives::random_suffix()));
    if tokio::fs::rename(signal_path, &scratch).await.is_err() {
        return None;
    }
    let contents = tokio::fs::read_to_string(&scratch).await.unwrap_or_default();
    let _ = tokio::fs::remove_file(&scratch).await;
    match contents.trim() {
        "stop" => Some(Signal::Stop),
        "destroy" => Some(Signal::Destroy),
        other if !other.is_empty() => {
            tracing::warn!("ignoring unrecognized signal contents: {other:?}");
            None
        }
        _ => None,
    }
}
