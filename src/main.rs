//! Multiplexer server binary
//!
//! Serves the WebSocket multiplexer endpoint plus a health check. All
//! settings come from the environment:
//!
//! - `SKYLIGHT_ADDR`: listen address (default `0.0.0.0:4466`)
//! - `SKYLIGHT_CONTEXTS`: path to a JSON cluster-contexts file
//! - `SKYLIGHT_ALLOWED_HOSTS`: comma-separated Host allowlist
//! - `SKYLIGHT_TRUSTED_PROXIES`: comma-separated proxy IPs/CIDRs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use skylight::telemetry::init_logging;
use skylight::{ws_handler, MemoryContextStore, Multiplexer, MultiplexerConfig};

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let addr: SocketAddr = std::env::var("SKYLIGHT_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:4466".to_string())
        .parse()?;

    let contexts = match std::env::var_os("SKYLIGHT_CONTEXTS") {
        Some(path) => MemoryContextStore::from_file(&PathBuf::from(path))?,
        None => MemoryContextStore::new(),
    };

    let config = MultiplexerConfig {
        allowed_hosts: env_list("SKYLIGHT_ALLOWED_HOSTS"),
        trusted_proxies: env_list("SKYLIGHT_TRUSTED_PROXIES"),
        ..Default::default()
    };

    let mux = Multiplexer::new(Arc::new(contexts), config);
    let _sweeper = mux.spawn_ip_sweeper();

    let app = Router::new()
        .route("/wsMultiplexer", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(mux);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting WebSocket multiplexer server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await?;

    Ok(())
}
