//! Terminal relay server with an xterm.js demo page.
//!
//! Run with: cargo run -p relay-server
//!
//! Then open http://localhost:3000 in your browser.

mod config;

use std::sync::Arc;

use anyhow::Context;
use axum::{response::Html, routing::get};
use shell_relay_core::BackendSelector;
use shell_relay_pty::{host_spawners, probe_native};
use shell_relay_session::SessionManager;
use shell_relay_transport::{
    AllowAll, ConnectionGate, TrustedHeader,
    websocket::{GatewayState, create_router},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::from_env().await?;

    let selector = Arc::new(BackendSelector::new());
    let backend = selector.probe(probe_native);
    tracing::info!(%backend, shell = %config.shell.program, "Backend selected");

    let manager = Arc::new(SessionManager::new(selector, host_spawners()));

    let gate: Arc<dyn ConnectionGate> = match &config.identity_header {
        Some(header) => Arc::new(
            TrustedHeader::new(header).context("RELAY_IDENTITY_HEADER is not a header name")?,
        ),
        None => Arc::new(AllowAll),
    };

    let state = GatewayState::new(
        Arc::clone(&manager),
        config.shell,
        config.options,
        gate,
    );

    let app = create_router(state)
        .route("/", get(index_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!("Server listening on http://{}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown();
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

const INDEX_HTML: &str = include_str!("index.html");
