//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::AppState;
use crate::handlers::{health, metrics, sends, webhooks};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::readiness));

    let message_routes = Router::new()
        .route("/", post(sends::create_message))
        .route("/:id", get(sends::get_message));

    Router::new()
        .nest("/health", health_routes)
        .route("/metrics", get(metrics::render))
        .route("/webhooks/events", post(webhooks::receive_event))
        .nest("/messages", message_routes)
        .route("/sends", post(sends::enqueue_send))
        .route("/sends/:id/cancel", post(sends::cancel_send))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
