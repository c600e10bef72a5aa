use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::RegistryStats;
use crate::websocket::SignalingState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    #[serde(flatten)]
    registry: RegistryStats,
}

#[derive(Debug, Deserialize)]
pub struct OfferQuery {
    pub session: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<SignalingState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        registry: state.registry.stats(),
    })
}

/// GET /get-offer - Stored offer as plain text for polling clients, empty when none
pub async fn get_offer(
    State(state): State<SignalingState>,
    Query(query): Query<OfferQuery>,
) -> String {
    let session_id = query
        .session
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| state.default_session_id.clone());
    debug!("Polling offer for session {}", session_id);
    state.registry.get_offer(&session_id).unwrap_or_default()
}

/// GET /sessions/:id/offer
pub async fn get_session_offer(
    State(state): State<SignalingState>,
    Path(session_id): Path<String>,
) -> Result<String, StatusCode> {
    state
        .registry
        .get_offer(&session_id)
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /sessions/:id/offer
pub async fn delete_session_offer(
    State(state): State<SignalingState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    if state.registry.remove_offer(&session_id) {
        debug!("Deleted offer for session {}", session_id);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
