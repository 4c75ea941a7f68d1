mod api;
mod config;
mod health;
mod mdns;
mod registry;
mod registry_manager;
mod router;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::health::HealthProber;
use crate::registry_manager::RegistryHandle;
use crate::router::ModelRouter;

/// Ports tried in order when no listen address is configured
const FALLBACK_PORTS: std::ops::Range<u16> = 8080..8100;

#[derive(Parser, Debug)]
#[command(name = "saturn-gatewayd", version, about = "OpenAI-compatible gateway for Saturn backends on the local network")]
struct Args {
    /// Path to a TOML config file; built-in defaults are used when omitted
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("saturn_gatewayd=info,tower_http=info"))
        )
        .init();

    tracing::info!("Starting saturn-gatewayd");

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.api.listen = Some(listen);
    }

    let registry = RegistryHandle::spawn();

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.discovery.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let cancel = CancellationToken::new();

    // Spawn mDNS browser task
    let (browser_tx, browser_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    let browser_daemon = mdns_daemon.clone();
    let service_types = config.discovery.service_types.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = mdns::browser::run_browser(browser_daemon, service_types, browser_tx, browser_cancel).await {
            tracing::error!("mDNS browser error: {}", e);
        }
    });

    // Spawn discovery bridge
    let bridge_cancel = cancel.clone();
    let bridge_registry = registry.clone();
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = registry_manager::run(bridge_registry, browser_rx, bridge_cancel).await {
            tracing::error!("Discovery bridge error: {}", e);
        }
    });

    let prober_handle = HealthProber::new(registry.clone(), config.health.clone())?
        .spawn(cancel.clone());

    let startup_wait = Duration::from_secs(config.discovery.startup_wait_secs);
    if registry.wait_for_first_service(startup_wait).await {
        tracing::info!("Discovered first service, continuing startup");
    } else {
        tracing::warn!(
            "No services discovered within {}s, serving anyway",
            config.discovery.startup_wait_secs
        );
    }

    let model_router = ModelRouter::new(registry.clone(), &config.router)?;
    let app_state = api::routes::AppState {
        registry: registry.clone(),
        router: model_router,
        max_retries: config.router.max_retries,
    };
    let app = api::routes::router(app_state);

    let listener = bind_listener(config.api.listen.as_deref()).await?;
    let local_addr = listener.local_addr().context("Failed to read listen address")?;
    tracing::info!("API listening on http://{}", local_addr);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(browser_handle, bridge_handle, prober_handle, server_handle);

    if let Err(e) = registry.shutdown().await {
        tracing::error!("Failed to shutdown registry: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Bind the configured address, or the first free fallback port on loopback
async fn bind_listener(listen: Option<&str>) -> Result<TcpListener> {
    if let Some(addr) = listen {
        return TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr));
    }

    for port in FALLBACK_PORTS {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!("Port {} unavailable: {}", port, e),
        }
    }

    anyhow::bail!(
        "No free port in {}..{} on 127.0.0.1",
        FALLBACK_PORTS.start,
        FALLBACK_PORTS.end
    )
}
