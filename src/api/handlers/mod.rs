mod deals;
mod system;

pub use deals::*;
pub use system::*;

use axum::http::StatusCode;

use crate::error::ProvdError;

/// Map a provider error onto an HTTP status
pub(crate) fn error_response(err: ProvdError) -> (StatusCode, String) {
    let status = match &err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        ProvdError::Validation(_)
        | ProvdError::NotPaused(_)
        | ProvdError::NoActiveTransfer(_)
        | ProvdError::InvalidCheckpointTransition { .. } => StatusCode::BAD_REQUEST,
        ProvdError::DealAlreadyExists(_) => StatusCode::CONFLICT,
        ProvdError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
