//! arbwatch - cross-venue crypto arbitrage monitor
//!
//! Streams spot and perpetual prices from four exchanges, polls on-chain
//! AMM pools, and serves live arbitrage opportunities over HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbwatch::api::create_router;
use arbwatch::models::Config;
use arbwatch::{ConnectionManager, PriceStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing();

    info!("starting arbwatch");

    let store = Arc::new(PriceStore::new());
    let manager = Arc::new(ConnectionManager::new(store));

    let app = create_router(manager.clone()).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("server error")?;

    Ok(())
}

/// Ctrl-C tears every adapter down before the server exits.
async fn shutdown_signal(manager: Arc<ConnectionManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("shutdown requested, disconnecting adapters");
    manager.emergency_disconnect_all().await;
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbwatch=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
