use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use ssdp_discovery::api;
use ssdp_discovery::config::Config;
use ssdp_discovery::SsdpDiscovery;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ssdp_discovery=info"))
        )
        .init();

    tracing::info!("Starting ssdp-discoveryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ssdp-discovery/discoveryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let mut discovery = SsdpDiscovery::new(config.discovery.clone());
    let signals = discovery
        .start()
        .with_context(|| format!("Failed to start discovery on {}", config.discovery.interface))?;

    match signals.server.wait().await {
        Some(addr) => tracing::info!("Answering searches on {}", addr),
        None => tracing::warn!("Server role inactive, running client-only"),
    }
    if let Some(addr) = signals.client.wait().await {
        tracing::info!("Searching from {}", addr);
    }

    for service in &config.services {
        match discovery.register_service(&service.id, service.address, service.port).await {
            Ok(()) => tracing::info!("Registered {} at {}:{}", service.id, service.address, service.port),
            Err(e) => tracing::warn!("Failed to register {}: {}", service.id, e),
        }
    }

    // Peers reported by the search callback, for the status API
    let (peers_tx, peers_rx) = watch::channel(Vec::new());

    if config.search.enabled {
        discovery
            .set_client_filter(config.search.filter.clone())
            .await
            .context("Failed to set search filter")?;

        let filter = config.search.filter.clone();
        discovery
            .start_search(
                move |addresses| {
                    for address in addresses {
                        tracing::info!("Discovered {} at {}", filter.as_deref().unwrap_or("peer"), address);
                        api::routes::record_peer(&peers_tx, address, filter.clone());
                    }
                },
                config.search.auto_stop,
            )
            .await
            .context("Failed to start search")?;
    }

    // Build API router
    let app_state = api::routes::AppState {
        server: discovery.server().ok(),
        peers_rx,
        config: Arc::new(config.discovery.clone()),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = server_handle.await;

    for service in &config.services {
        if let Err(e) = discovery.unregister_service(&service.id).await {
            tracing::debug!("Failed to unregister {}: {}", service.id, e);
        }
    }

    if let Err(e) = discovery.stop().await {
        tracing::error!("Failed to stop discovery: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
