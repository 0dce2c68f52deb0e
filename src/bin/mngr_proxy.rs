//! `mngr-proxy`: hosts the reverse HTTP+WebSocket proxy (C10).
//!
//! Follows `RactorLabs-ractor`'s per-service binary shape
//! (`src/host/main.rs`): a `clap::Parser` struct with
//! `env` fallbacks, `init_service_logging`, then hand off to the library.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use mngr::auth::FileAuthStore;
use mngr::backend_resolver::BackendResolver;
use mngr::config::MngrConfig;
use mngr::logging;
use mngr::proxy::{build_router, ProxyState};

#[derive(Parser)]
#[command(name = "mngr-proxy")]
#[command(about = "Reverse HTTP+WebSocket proxy for mngr agents")]
struct Args {
    /// Address to bind the proxy's HTTP listener to.
    #[arg(long, env = "MNGR_PROXY_BIND", default_value = "127.0.0.1:8787")]
    bind: String,

    /// Root directory holding `auth/`, `backends.json`, and logs.
    #[arg(long, env = "MNGR_HOST_DIR")]
    host_dir: Option<String>,

    /// Disable the `Secure` cookie attribute; for local development only.
    #[arg(long, env = "MNGR_PROXY_INSECURE_COOKIES")]
    insecure_cookies: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, _config_path) = MngrConfig::load_default()?;
    let host_dir = args
        .host_dir
        .map(std::path::PathBuf::from)
        .unwrap_or(config.default_host_dir);

    let _ = logging::rotate_logs_on_startup(&host_dir.join("logs").to_string_lossy(), "mngr_proxy");
    logging::init_service_logging(&host_dir.join("logs").to_string_lossy(), "mngr_proxy")
        .context("failed to initialize logging")?;

    let auth_store = FileAuthStore::new(host_dir.join("auth"));
    let signing_key = auth_store
        .get_signing_key()
        .await
        .context("failed to load or generate the cookie signing key")?;
    let resolver = BackendResolver::new(host_dir.clone());

    let mut state = ProxyState::new(auth_store, resolver, signing_key);
    state.secure_cookies = !args.insecure_cookies;
    let state = Arc::new(state);

    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!("mngr-proxy listening on {}", args.bind);

    axum::serve(listener, router)
        .await
        .context("proxy server exited with an error")?;

    Ok(())
}
