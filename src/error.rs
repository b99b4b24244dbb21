use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::Checkpoint;

/// Main error type for the deal provider
#[derive(Error, Debug)]
pub enum ProvdError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lookup errors
    #[error("deal not found: {0}")]
    DealNotFound(Uuid),

    #[error("deal not found for signed proposal {0}")]
    DealNotFoundByProposal(String),

    #[error("deal handler not found: {0}")]
    HandlerNotFound(Uuid),

    #[error("deal {0} already exists")]
    DealAlreadyExists(Uuid),

    #[error("deal handler for {0} already exists")]
    HandlerAlreadyExists(Uuid),

    // Resource reservation errors
    #[error("insufficient storage space: requested {requested} bytes, {free} bytes free")]
    InsufficientCapacity { requested: u64, free: u64 },

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    // Deal state errors
    #[error("Invalid checkpoint transition: from {from} to {to}")]
    InvalidCheckpointTransition { from: Checkpoint, to: Checkpoint },

    #[error("deal {0} is not paused")]
    NotPaused(Uuid),

    #[error("deal {0} has no active data transfer")]
    NoActiveTransfer(Uuid),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("deal filter failed: {0}")]
    Filter(String),

    // Execution errors
    #[error("data transfer failed: {0}")]
    Transfer(String),

    #[error("data transfer exceeded maximum duration of {0:?}")]
    TransferTimeout(Duration),

    #[error("data transfer cancelled by user")]
    TransferCancelled,

    #[error("too many slots are being committed, try again later")]
    SlotsSaturated,

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("announce failed: {0}")]
    Announce(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProvdError {
    /// Identifier did not resolve in the deal store or handler registry.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProvdError::DealNotFound(_)
                | ProvdError::DealNotFoundByProposal(_)
                | ProvdError::HandlerNotFound(_)
        )
    }

    /// A reservation pool could not satisfy the request. Callers turn this into a
    /// rejection, not a fault.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            ProvdError::InsufficientCapacity { .. } | ProvdError::InsufficientFunds { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvdError::Cancelled)
    }
}

/// Result type alias for ProvdError
pub type Result<T> = std::result::Result<T, ProvdError>;
