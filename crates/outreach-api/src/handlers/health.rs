//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Basic health check
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Readiness check (database reachable when one is configured)
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    match &state.db_pool {
        Some(pool) => match pool.health_check().await {
            Ok(_) => StatusCode::OK,
            Err(e) => {
                tracing::warn!(error = %e, "Readiness check failed");
                StatusCode::SERVICE_UNAVAILABLE
            }
        },
        None => StatusCode::OK,
    }
}
