// ============================
// crates/backend-bin/src/main.rs
// ============================
//! Server binary: wires configuration, logging, the in-memory store,
//! and the WebSocket router together.

use anyhow::Context;
use backend_lib::{config::Settings, store::MemoryStore, ws_router, AppState};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().unwrap_or_else(|err| {
        // config problems fall back to defaults rather than refusing to start
        eprintln!("config error, using defaults: {err}");
        Settings::default()
    });

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if settings.heartbeat_timeout_ms < 1_000 {
        warn!(
            heartbeat_timeout_ms = settings.heartbeat_timeout_ms,
            "heartbeat timeout is very aggressive"
        );
    }

    let state = Arc::new(AppState::new(MemoryStore::new(), settings.clone()));
    let app = ws_router::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "rendezvous server listening");

    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}
