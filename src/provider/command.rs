//! Requests served by the provider run loop
//!
//! Every request carries a single-use reply slot. The run loop answers each
//! request exactly once; a dropped reply slot means the loop shut down.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::traits::StorageSpace;
use crate::domain::ProviderDeal;
use crate::error::Result;

/// Outcome of an admission request. A rejection is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRejectionInfo {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl DealRejectionInfo {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: String::new(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
        }
    }
}

/// Submit a new proposal, or an offline deal whose data is now available
#[derive(Debug)]
pub struct AcceptDealRequest {
    pub deal: ProviderDeal,
    pub is_import: bool,
    pub reply: oneshot::Sender<Result<DealRejectionInfo>>,
}

/// A deal reached a finishing checkpoint. Replies with the deal as persisted.
#[derive(Debug)]
pub struct FinishedDealRequest {
    pub deal: ProviderDeal,
    pub reply: oneshot::Sender<Result<ProviderDeal>>,
}

/// A deal's publish message was sent
#[derive(Debug)]
pub struct PublishedDealRequest {
    pub deal: ProviderDeal,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Operator decision for a paused deal
#[derive(Debug)]
pub struct UpdateRetryStateRequest {
    pub deal_uuid: Uuid,
    /// `true` to retry, `false` to fail permanently
    pub retry: bool,
    pub reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug)]
pub enum StorageSpaceRequest {
    Query {
        reply: oneshot::Sender<Result<StorageSpace>>,
    },
    SetCapacity {
        total: u64,
        reply: oneshot::Sender<Result<()>>,
    },
}
