//! HTTP surface: JSON run commands plus an SSE event feed.

pub mod api;
mod sse;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

pub use api::{ApiError, AppState, SharedState};

use crate::config::StagehandConfig;
use crate::orchestrator::RunService;

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the HTTP server and serve until Ctrl+C.
pub async fn start_server(config: &StagehandConfig) -> Result<()> {
    let service = RunService::from_config(config).context("Failed to initialize run service")?;
    let state = Arc::new(AppState { service });

    let server = &config.toml.server;
    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, dev_mode = server.dev_mode, "Server listening");
    println!("Stagehand running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
