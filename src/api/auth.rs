use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};

use crate::api::state::AppState;

fn extract_bearer_token(raw: &str) -> Option<&str> {
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
}

pub fn is_valid_token(state: &AppState, provided: &str) -> bool {
    state
        .token
        .as_deref()
        .map(|expected| provided.trim() == expected)
        .unwrap_or(true)
}

/// Mutating routes require `Authorization: Bearer <api.token>` when a
/// token is configured.
pub fn ensure_authorized(
    state: &AppState,
    headers: &HeaderMap,
) -> std::result::Result<(), (StatusCode, String)> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(());
    };

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token);

    if token.is_some_and(|v| v == expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            "missing or invalid bearer token".to_string(),
        ))
    }
}
