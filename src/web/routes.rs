use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Create the preview router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/events", get(handlers::events))
        .route("/health", get(handlers::health));

    Router::new()
        .route("/stream.mjpeg", get(handlers::mjpeg_stream))
        .route("/snapshot.jpg", get(handlers::snapshot))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
