use anyhow::Result;
use axum::{extract::Extension, routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing;

use courier_core::config::ServerConfig;
use courier_core::DispatchQueue;
use courier_delivery::TransportRegistry;

use crate::handlers;

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<DispatchQueue>,
    pub transports: Arc<TransportRegistry>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(state: ApiState, config: &ServerConfig, cancel: CancellationToken) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.api_port)).await?;
    tracing::info!("Starting API server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}
