//! # API Endpoint Handlers

use super::{
    AppState,
    types::{ErrorResponse, HealthResponse, PluginEntry, RejectResponse, StatusResponse},
};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gnosis_core::{Delivery, RejectReason};
use std::sync::Arc;

// =============================================================================
// HEALTH HANDLER
// =============================================================================

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// STATUS HANDLER
// =============================================================================

pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(StatusResponse::from_core(&state.core)))
}

// =============================================================================
// PLUGINS HANDLER
// =============================================================================

/// Registered operations and their metadata.
pub async fn plugins_handler(State(state): State<AppState>) -> impl IntoResponse {
    let plugins: Vec<PluginEntry> = state
        .core
        .registry()
        .list_plugins()
        .into_iter()
        .map(|(operation, info)| PluginEntry { operation, info })
        .collect();
    Json(plugins)
}

// =============================================================================
// MESSAGE HANDLER
// =============================================================================

/// HTTP status for a rejected message.
pub fn reject_status(reason: RejectReason) -> StatusCode {
    match reason {
        RejectReason::BadSignature => StatusCode::UNAUTHORIZED,
        RejectReason::Replay => StatusCode::CONFLICT,
        RejectReason::Forbidden => StatusCode::FORBIDDEN,
    }
}

/// Deliver a signed message to the core.
///
/// The body is the JSON `SignedMessage`. An applied message answers 200 with
/// the signed response envelope; a rejected one answers with the status from
/// [`reject_status`]. Core work runs on the blocking pool since commits touch
/// the journal.
pub async fn message_handler(State(state): State<AppState>, body: String) -> Response {
    let core = Arc::clone(&state.core);
    let delivery = tokio::task::spawn_blocking(move || core.router().process_json(&body)).await;

    match delivery {
        Ok(Delivery::Applied(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Delivery::Rejected { reason, detail }) => (
            reject_status(reason),
            Json(RejectResponse::new(reason, detail)),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "message worker failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("message processing failed")),
            )
                .into_response()
        }
    }
}
