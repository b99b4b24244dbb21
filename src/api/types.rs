use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::{DealParams, ProviderDeal};

// ============================================================================
// Deal Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitDealRequest {
    /// Peer id of the client that sent the proposal
    pub client_peer_id: String,
    pub deal: DealParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDataRequest {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealResponse {
    #[serde(flatten)]
    pub deal: ProviderDeal,
    /// Bytes received so far while a transfer is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferred: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub ok: bool,
}

// ============================================================================
// System Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCapacityRequest {
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: i64,
}

// ============================================================================
// WebSocket Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    #[serde(rename = "new_deal")]
    NewDeal(ProviderDeal),
    #[serde(rename = "deal_update")]
    DealUpdate(ProviderDeal),
    /// Subscriber fell behind and missed `n` messages
    #[serde(rename = "lagged")]
    Lagged(u64),
}
