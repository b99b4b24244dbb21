use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::auth::is_valid_token;
use crate::api::handlers::error_response;
use crate::api::state::AppState;
use crate::api::types::WsMessage;
use crate::domain::ProviderDeal;

#[derive(Deserialize)]
pub struct WsAuth {
    token: Option<String>,
}

fn authorize(state: &AppState, auth: &WsAuth) -> std::result::Result<(), StatusCode> {
    if state.token.is_none() {
        return Ok(());
    }
    match auth.token.as_deref() {
        Some(t) if is_valid_token(state, t) => Ok(()),
        _ => {
            warn!("WebSocket connection rejected: missing or invalid token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// GET /ws/deals: stream of newly accepted deals
pub async fn new_deals_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuth>,
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, StatusCode> {
    authorize(&state, &auth)?;
    let rx = state.provider.subscribe_new_deals();
    Ok(ws.on_upgrade(|socket| forward(socket, rx, WsMessage::NewDeal)))
}

/// GET /ws/deals/:id: status updates of one in-flight deal
pub async fn deal_updates_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<Uuid>,
    Query(auth): Query<WsAuth>,
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, (StatusCode, String)> {
    authorize(&state, &auth).map_err(|s| (s, "missing or invalid token".to_string()))?;
    let rx = state
        .provider
        .subscribe_deal_updates(id)
        .await
        .map_err(error_response)?;
    Ok(ws.on_upgrade(|socket| forward(socket, rx, WsMessage::DealUpdate)))
}

async fn forward(
    socket: WebSocket,
    mut rx: broadcast::Receiver<ProviderDeal>,
    wrap: fn(ProviderDeal) -> WsMessage,
) {
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(deal) => wrap(deal),
                Err(RecvError::Lagged(n)) => WsMessage::Lagged(n),
                Err(RecvError::Closed) => break,
            };
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize WebSocket message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    send_task.abort();
    info!("WebSocket connection closed");
}
