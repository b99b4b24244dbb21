use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use uuid::Uuid;

use super::error_response;
use crate::api::{auth::ensure_authorized, state::AppState, types::*};
use crate::provider::DealRejectionInfo;

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, String)>;

/// POST /api/deals
pub async fn submit_deal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitDealRequest>,
) -> ApiResult<DealRejectionInfo> {
    ensure_authorized(&state, &headers)?;
    state
        .provider
        .execute_deal(req.deal, &req.client_peer_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/deals/:id/import
pub async fn import_deal_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<ImportDataRequest>,
) -> ApiResult<DealRejectionInfo> {
    ensure_authorized(&state, &headers)?;
    state
        .provider
        .import_offline_deal_data(id, req.path)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/deals/:id
pub async fn get_deal(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<DealResponse> {
    let deal = state.provider.deal(id).await.map_err(error_response)?;
    Ok(Json(DealResponse {
        transferred: state.provider.transferred(id),
        deal,
    }))
}

/// GET /api/deals/by-proposal/:proposal_id
pub async fn get_deal_by_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<String>,
) -> ApiResult<DealResponse> {
    let deal = state
        .provider
        .deal_by_proposal(&proposal_id)
        .await
        .map_err(error_response)?;
    Ok(Json(DealResponse {
        transferred: state.provider.transferred(deal.deal_uuid),
        deal,
    }))
}

/// POST /api/deals/:id/retry
pub async fn retry_deal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<ActionResponse> {
    ensure_authorized(&state, &headers)?;
    state
        .provider
        .retry_paused_deal(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ActionResponse { ok: true }))
}

/// POST /api/deals/:id/fail
pub async fn fail_deal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<ActionResponse> {
    ensure_authorized(&state, &headers)?;
    state
        .provider
        .fail_paused_deal(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ActionResponse { ok: true }))
}

/// POST /api/deals/:id/cancel-transfer
pub async fn cancel_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<ActionResponse> {
    ensure_authorized(&state, &headers)?;
    state
        .provider
        .cancel_transfer(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ActionResponse { ok: true }))
}
