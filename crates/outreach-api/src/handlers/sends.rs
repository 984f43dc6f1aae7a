//! Message and send request handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use outreach_core::SendRequest;
use outreach_storage::models::{NewOutreachMessage, OutreachMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::{api_error, from_core_error, ApiError};
use crate::auth::AppState;

/// Response after queuing a send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendQueuedResponse {
    pub item_id: Uuid,
    pub message_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub status: String,
}

/// Response after a cancel request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCancelledResponse {
    pub item_id: Uuid,
    /// False when the item was already claimed or concluded
    pub cancelled: bool,
}

/// Create a draft message
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewOutreachMessage>,
) -> Result<(StatusCode, Json<OutreachMessage>), ApiError> {
    let message = state.core.create_message(input).await.map_err(|e| {
        error!(error = %e, "Failed to create message");
        from_core_error(&e)
    })?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Get a message
pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<OutreachMessage>, ApiError> {
    state
        .core
        .repositories()
        .messages
        .get(message_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Database error while fetching message");
            from_core_error(&e)
        })?
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Message {} not found", message_id),
            )
        })
}

/// Queue a message for sending. Returns at once, even when the account
/// has no headroom until later.
pub async fn enqueue_send(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<SendQueuedResponse>), ApiError> {
    let item = state.core.enqueue(request).await.map_err(|e| {
        if !e.is_client_error() {
            error!(error = %e, "Failed to queue send");
        }
        from_core_error(&e)
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SendQueuedResponse {
            item_id: item.id,
            message_id: item.message_id,
            scheduled_for: item.scheduled_for,
            status: item.status,
        }),
    ))
}

/// Cancel a queued send that no sender has claimed yet
pub async fn cancel_send(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<Uuid>,
) -> Result<Json<SendCancelledResponse>, ApiError> {
    let cancelled = state.core.cancel_send(item_id).await.map_err(|e| {
        if !e.is_client_error() {
            error!(error = %e, "Failed to cancel send");
        }
        from_core_error(&e)
    })?;
    Ok(Json(SendCancelledResponse { item_id, cancelled }))
}
