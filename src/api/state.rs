use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::provider::Provider;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<Provider>,

    /// Bearer token required on mutating routes; open when unset
    pub token: Option<Arc<str>>,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(provider: Arc<Provider>, token: Option<String>) -> Self {
        Self {
            provider,
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .map(Arc::from),
            start_time: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
