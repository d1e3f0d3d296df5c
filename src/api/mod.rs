mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::BotEngine;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub engine: Arc<BotEngine>,
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, engine: Arc<BotEngine>, max_body: usize) -> Result<()> {
    let state = Arc::new(AppState { engine });

    let app = Router::new()
        .route("/projects/{id}/workflows", post(handlers::publish_workflow))
        .route("/projects/{id}/events", post(handlers::ingest_event))
        .route("/executions", get(handlers::list_executions))
        .route("/executions/{id}", get(handlers::get_execution))
        .route("/executions/{id}", delete(handlers::delete_execution))
        .route("/nodes", get(handlers::list_nodes))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Botflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
