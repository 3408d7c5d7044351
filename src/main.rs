mod cache;
mod config;
mod coordination;
mod http;
mod lifecycle;
mod metrics;
mod server;
mod shared;
mod tls;

#[cfg(test)]
mod testutil;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheStore, DiskCache};
use crate::coordination::{release, ControlPlaneClient, ServerAssignment};
use crate::http::handler::RequestPolicy;
use crate::http::origin::{OriginClient, RetryPolicy};
use crate::lifecycle::{shutdown_signal, Coordinator, Lifecycle, REFRESH_INTERVAL};
use crate::metrics::{CacheOutcome, MetricsRegistry};
use crate::shared::Shared;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "edgecache", about = "Edge image cache node", version)]
struct Cli {
    /// Path to the YAML settings file.
    #[arg(short, long, default_value = "settings.yaml")]
    settings: PathBuf,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
pub struct AppState {
    pub cache: Arc<dyn CacheStore>,
    pub origin: OriginClient,
    /// Replaced wholesale by the refresh loop.
    pub assignment: Shared<ServerAssignment>,
    pub metrics: MetricsRegistry,
    pub lifecycle: Lifecycle,
    pub policy: RequestPolicy,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // reqwest and the listener both link rustls; pin one provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        settings_path = %cli.settings.display(),
        version = env!("CARGO_PKG_VERSION"),
        "starting edgecache"
    );

    // ---- Settings ----
    if !cli.settings.exists() {
        config::write_sample_settings(&cli.settings)?;
        anyhow::bail!(
            "no settings file found; a sample was written to {}. Set client_secret and restart",
            cli.settings.display()
        );
    }
    let settings = config::load_settings(&cli.settings)?;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("edgecache/", env!("CARGO_PKG_VERSION")))
        .timeout(coordination::control::REQUEST_TIMEOUT)
        .build()
        .context("failed to build reqwest client")?;

    // ---- Advisory release check ----
    if let Some(url) = &settings.release_check_url {
        release::advise(&http_client, url, env!("CARGO_PKG_VERSION")).await;
    }

    // ---- Cache ----
    let disk = DiskCache::open(
        &settings.cache_directory,
        settings.cache_limit_bytes(),
        settings.cache_scan_interval_in_seconds,
        settings.cache_refresh_age_in_seconds,
    )
    .await?;
    let cache: Arc<dyn CacheStore> = Arc::new(disk.clone());

    // ---- Registration ----
    let control = ControlPlaneClient::new(http_client, settings.control_plane_url.clone());
    let assignment = control
        .ping(&settings)
        .await
        .context("failed to register with the control plane")?;
    let credentials = assignment
        .tls
        .as_ref()
        .context("control plane assignment carries no TLS credentials")?;
    let tls_config = tls::load_server_config(credentials)?;

    // ---- App state ----
    let lifecycle = Lifecycle::new();
    let metrics = MetricsRegistry::new();
    let assignment = Shared::new(assignment);
    let state = Arc::new(AppState {
        cache: Arc::clone(&cache),
        origin: OriginClient::new(RetryPolicy::default()).context("failed to build origin client")?,
        assignment: assignment.clone(),
        metrics: metrics.clone(),
        lifecycle: lifecycle.clone(),
        policy: RequestPolicy::new(&settings.allowed_origin)?,
    });

    let coordinator = Coordinator {
        settings_path: cli.settings.clone(),
        settings: Shared::new(settings.clone()),
        assignment,
        cache: Arc::clone(&cache),
        control,
        lifecycle: lifecycle.clone(),
        refresh_interval: REFRESH_INTERVAL,
    };

    // ---- Spawn services ----
    let refresh_handle = tokio::spawn(coordinator.clone().run_refresh_loop());

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], settings.client_port));
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {listen_addr}"))?;
    let mut server_handle = tokio::spawn(server::serve(
        listener,
        Some(TlsAcceptor::from(tls_config)),
        http::handler::create_router(state),
        lifecycle.terminated(),
    ));

    // ---- Await shutdown ----
    let server_exit = tokio::select! {
        () = shutdown_signal() => None,
        joined = &mut server_handle => {
            tracing::error!("listener exited before shutdown was requested");
            Some(joined)
        }
    };

    let outcome = coordinator.shutdown().await;
    let (hits, hit_ms) = metrics.totals(CacheOutcome::Hit);
    let (misses, miss_ms) = metrics.totals(CacheOutcome::Miss);
    tracing::info!(?outcome, hits, hit_ms, misses, miss_ms, "drain finished");

    let _ = refresh_handle.await;
    let joined = match server_exit {
        Some(joined) => joined,
        None => server_handle.await,
    };
    joined.context("listener task panicked")??;

    tracing::info!(
        entries = disk.entry_count(),
        used_bytes = disk.used_bytes(),
        "closing cache"
    );
    cache.close().await;

    tracing::info!("edgecache shut down cleanly");
    Ok(())
}
