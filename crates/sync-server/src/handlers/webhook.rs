use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use sync_core::webhook::{parse_webhook_payload, WebhookPayload};

use crate::app_state::AppState;

/// Receives a CDS change notification and enqueues it. Never blocks on the
/// actual sync work — that happens on the worker task, independently.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    match parse_webhook_payload(&payload) {
        Some(notification) => {
            state.queue.enqueue_change_notification(
                notification.relay_id,
                notification.resource_id,
                notification.timestamp,
            );
            axum::http::StatusCode::ACCEPTED
        }
        None => {
            tracing::warn!("rejecting malformed webhook payload");
            axum::http::StatusCode::BAD_REQUEST
        }
    }
}
