use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};

use super::error_response;
use crate::api::{auth::ensure_authorized, state::AppState, types::*};
use crate::provider::StorageSpace;

/// GET /health
pub async fn health_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let resp = HealthResponse {
        status: if state.provider.is_stopped() {
            "stopped".to_string()
        } else {
            "ok".to_string()
        },
        uptime_secs: state.uptime_seconds(),
    };

    if state.provider.is_stopped() {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(resp)))
    } else {
        Ok(Json(resp))
    }
}

/// GET /api/storage
pub async fn get_storage(
    State(state): State<AppState>,
) -> std::result::Result<Json<StorageSpace>, (StatusCode, String)> {
    state
        .provider
        .storage_space()
        .await
        .map(Json)
        .map_err(error_response)
}

/// PUT /api/storage
pub async fn set_storage_capacity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SetCapacityRequest>,
) -> std::result::Result<Json<StorageSpace>, (StatusCode, String)> {
    ensure_authorized(&state, &headers)?;
    state
        .provider
        .set_storage_capacity(req.total)
        .await
        .map_err(error_response)?;
    state
        .provider
        .storage_space()
        .await
        .map(Json)
        .map_err(error_response)
}
