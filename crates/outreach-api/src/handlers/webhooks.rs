//! Webhook intake handler

use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, Json};
use outreach_core::ProcessOutcome;
use std::sync::Arc;
use tracing::{error, warn};

use super::{api_error, from_core_error, ApiError};
use crate::auth::{authorize_webhook, AppState};

/// Accept one provider event
pub async fn receive_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ProcessOutcome>, ApiError> {
    if !authorize_webhook(&state, &headers, &body) {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "INVALID_SIGNATURE",
            "Webhook signature is missing or invalid",
        ));
    }

    let raw: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(
            error = %e,
            body = %String::from_utf8_lossy(&body),
            "Rejecting unparseable webhook body"
        );
        state.core.metrics().event("malformed");
        api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "MALFORMED_PAYLOAD",
            format!("Body is not JSON: {}", e),
        )
    })?;

    state.core.process_event(raw).await.map(Json).map_err(|e| {
        if !e.is_client_error() {
            error!(error = %e, "Failed to process webhook event");
        }
        from_core_error(&e)
    })
}
