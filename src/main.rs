mod cache;
mod config;
mod env;
mod health;
mod http;
mod metrics;
mod origin;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::{CacheStore, DepotPolicy};
use crate::config::Config;
use crate::metrics::{MetricsRegistry, RequestObserver};
use crate::origin::{HttpOrigin, Origin};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "lancache", about = "Caching reverse proxy for Steam depot content")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/lancache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Which depots are cached.  Fixed at startup.
    pub policy: Arc<DepotPolicy>,
    pub store: CacheStore,
    pub origin: Arc<dyn Origin>,
    pub observer: Arc<dyn RequestObserver>,
    /// Read on every request so the bypass switch can be flipped live.
    pub bypass: Arc<dyn Fn() -> bool + Send + Sync>,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if env::production() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    init_tracing();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);
    tracing::info!(config = %cli.config, "configuration loaded");

    // ---- Cache ----
    let store = CacheStore::new(&config.storage.cache_dir);
    store
        .ensure_root()
        .await
        .context("failed to prepare cache directory")?;
    tracing::info!(cache_dir = %store.root().display(), "cache directory ready");

    let policy = Arc::new(DepotPolicy::from_config(&config.steam));

    // ---- Upstream ----
    let origin = HttpOrigin::new(&config.upstream)?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        policy,
        store,
        origin: Arc::new(origin),
        observer: Arc::new(metrics.clone()),
        bypass: Arc::new(env::bypass_cache),
    });

    // ---- Listeners ----
    let cache_server = server::bind(
        "cache",
        &config.proxy.http_listen,
        http::handler::create_router(state),
    )
    .await?;

    let metrics_server = match &config.proxy.metrics_listen {
        Some(addr) => Some(
            server::bind("metrics", addr, http::handler::create_metrics_router(metrics)).await?,
        ),
        None => {
            tracing::info!("metrics listener disabled");
            None
        }
    };

    tracing::info!(addr = %cache_server.local_addr(), "proxy ready");

    // ---- Run until signalled ----
    shutdown_signal().await;

    let grace = config.proxy.shutdown_grace();
    tracing::info!(?grace, "shutting down");

    let cache_result = cache_server.stop(grace).await;
    if let Some(metrics_server) = metrics_server {
        metrics_server.stop(grace).await?;
    }
    cache_result?;

    tracing::info!("shutdown complete");
    Ok(())
}
