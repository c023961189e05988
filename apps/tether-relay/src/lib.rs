//! HTTP relay that parks handshake payloads until the other peer polls them.
//!
//! Offers live under `/api/signal`, answers under `/api/answer`. Both are
//! backed by the same [`tether_core::SessionRegistry`].

pub mod cli;
pub mod config;
pub mod handlers;
pub mod state;
pub mod telemetry;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::{Direction, SessionRegistry};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::RelayConfig;
pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            Direction::Offer.path(),
            post(handlers::post_offer).get(handlers::get_offer),
        )
        .route(
            Direction::Answer.path(),
            post(handlers::post_answer).get(handlers::get_answer),
        )
        .route("/api/local-ip", get(handlers::local_ip))
        .route("/health", get(handlers::health_check))
        .route("/debug/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind, serve until ctrl-c, then stop the sweeper.
pub async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let registry = SessionRegistry::new(config.store.clone());
    let state = AppState::new(registry, metrics, config.public_url.clone());
    let sweeper = state.spawn_sweeper(config.sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        ttl_secs = config.store.ttl.as_secs(),
        overwrite_policy = %config.store.overwrite_policy,
        "tether relay listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    sweeper.abort();
    info!("tether relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
