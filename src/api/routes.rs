use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{
    handlers,
    state::AppState,
    websocket::{deal_updates_handler, new_deals_handler},
};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Deal endpoints
        .route("/api/deals", post(handlers::submit_deal))
        .route("/api/deals/:id", get(handlers::get_deal))
        .route(
            "/api/deals/by-proposal/:proposal_id",
            get(handlers::get_deal_by_proposal),
        )
        .route("/api/deals/:id/import", post(handlers::import_deal_data))
        .route("/api/deals/:id/retry", post(handlers::retry_deal))
        .route("/api/deals/:id/fail", post(handlers::fail_deal))
        .route(
            "/api/deals/:id/cancel-transfer",
            post(handlers::cancel_transfer),
        )
        // Storage endpoints
        .route(
            "/api/storage",
            get(handlers::get_storage).put(handlers::set_storage_capacity),
        )
        // System endpoints
        .route("/health", get(handlers::health_handler))
        // WebSocket endpoints
        .route("/ws/deals", get(new_deals_handler))
        .route("/ws/deals/:id", get(deal_updates_handler))
        .with_state(state)
        .layer(cors)
}
