//! offgrid server entry point.
//!
//! Loads configuration, opens the store, installs the configured generation
//! and serves the cache as MCP tools on stdio.
//! Logging goes to stderr to avoid interfering with the JSON-RPC protocol on stdout.

use std::sync::Arc;

use anyhow::Result;
use offgrid_client::{FetchConfig, HttpNetwork, OfflineCache};
use offgrid_core::{AppConfig, CacheDb, TracingSink};
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tracing_subscriber::EnvFilter;

mod error;
mod handler;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!("Starting offgrid {} on stdio transport", config.generation());

    let db = CacheDb::open(&config.db_path)
        .await?
        .with_quota(config.quota_bytes);
    let network = Arc::new(HttpNetwork::new(FetchConfig::from(&config))?);
    let cache = Arc::new(OfflineCache::from_config(config, db, network, Arc::new(TracingSink))?);

    // Serve from whatever is stored even if the install could not reach the network.
    if let Err(e) = cache.boot().await {
        tracing::warn!("install failed: {}", e);
    }
    let refresh = cache.spawn_refresh();

    let handler = handler::OffgridServer::new(cache);
    let transport = stdio();
    let server = serve_server(handler, transport).await?;

    server.waiting().await?;
    refresh.abort();

    Ok(())
}
