//! Collaborator contracts consumed by the provider
//!
//! Everything the provider does not own itself sits behind one of these
//! traits: the deal store, the reservation pools, the committing subsystem,
//! the network transport, the chain publisher and the deal filter.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::domain::{ProviderDeal, SlotNumber};
use crate::error::Result;

/// Readable payload handed to the committing subsystem
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// Persistent deal store
#[async_trait]
pub trait DealStore: Send + Sync {
    /// Create tables / run migrations. Failure is fatal at startup.
    async fn init(&self) -> Result<()>;

    async fn create(&self, deal: &ProviderDeal) -> Result<()>;

    async fn update(&self, deal: &ProviderDeal) -> Result<()>;

    /// `ProvdError::DealNotFound` when the id is unknown
    async fn by_id(&self, deal_uuid: Uuid) -> Result<ProviderDeal>;

    /// `ProvdError::DealNotFoundByProposal` when no deal has this proposal id
    async fn by_signed_proposal(&self, proposal_id: &str) -> Result<ProviderDeal>;

    /// Deals that have not reached `Complete`
    async fn list_active(&self) -> Result<Vec<ProviderDeal>>;

    /// Deals at `Complete` whose cleanup has not been recorded
    async fn list_completed(&self) -> Result<Vec<ProviderDeal>>;
}

/// Storage space accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpace {
    pub total: u64,
    pub tagged: u64,
    pub free: u64,
}

/// Storage capacity pool
#[async_trait]
pub trait CapacityManager: Send + Sync {
    /// Reserve `size` bytes for the deal. `ProvdError::InsufficientCapacity` when
    /// the pool cannot hold it.
    async fn tag(&self, deal_uuid: Uuid, size: u64) -> Result<()>;

    /// Release the deal's reservation. Untagging an unknown deal is not an error.
    async fn untag(&self, deal_uuid: Uuid) -> Result<()>;

    async fn space(&self) -> Result<StorageSpace>;

    /// Change the pool ceiling without touching existing tags
    async fn set_total(&self, total: u64) -> Result<()>;
}

/// Funds pool (collateral + publish fees)
#[async_trait]
pub trait FundsManager: Send + Sync {
    /// `ProvdError::InsufficientFunds` when the balance cannot cover both amounts.
    async fn tag(&self, deal_uuid: Uuid, collateral: Decimal, publish_fee: Decimal) -> Result<()>;

    /// Release and return `(collateral, publish_fee)`; zeros when nothing was tagged.
    async fn untag(&self, deal_uuid: Uuid) -> Result<(Decimal, Decimal)>;

    async fn available(&self) -> Result<Decimal>;
}

/// Physical state of a committed slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Pending,
    Sealing,
    Sealed,
    Failed,
    Removed,
}

impl SlotState {
    /// No further physical progress is expected
    pub fn is_final(&self) -> bool {
        matches!(self, SlotState::Sealed | SlotState::Failed | SlotState::Removed)
    }
}

/// Metadata passed along with a payload commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub deal_uuid: Uuid,
    pub chain_deal_id: Option<u64>,
    pub publish_cid: String,
    pub piece_cid: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
}

/// Resource-committing subsystem
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PieceCommitter: Send + Sync {
    /// Place the payload. Returns `(slot, offset)`. `ProvdError::SlotsSaturated`
    /// signals transient contention.
    async fn commit(
        &self,
        size: u64,
        payload: PayloadReader,
        info: &CommitInfo,
    ) -> Result<(SlotNumber, u64)>;

    async fn slot_status(&self, slot: SlotNumber) -> Result<SlotState>;
}

/// Bytes received so far for one transfer
pub type TransferProgress = Arc<AtomicU64>;

/// Network transport moving payload bytes into the staging area
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write the payload to `dest`, bumping `progress` as bytes arrive.
    /// Returns the number of bytes written.
    async fn transfer(
        &self,
        deal: &ProviderDeal,
        dest: &Path,
        progress: TransferProgress,
    ) -> Result<u64>;
}

/// Chain client used to publish deals
#[async_trait]
pub trait DealPublisher: Send + Sync {
    /// Send the publish message; returns its reference
    async fn publish(&self, deal: &ProviderDeal) -> Result<String>;

    /// Wait for the publish message to land; returns the chain deal id
    async fn wait_for_publish(&self, publish_cid: &str) -> Result<u64>;
}

/// Announces committed deals to indexers
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, deal: &ProviderDeal) -> Result<()>;
}

/// Inputs for a deal filter decision
#[derive(Debug, Clone, Serialize)]
pub struct FilterParams {
    pub deal: ProviderDeal,
    pub storage: StorageSpace,
    pub available_funds: Decimal,
}

/// Outcome of a deal filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub accept: bool,
    pub reason: String,
}

impl FilterDecision {
    pub fn accept() -> Self {
        Self {
            accept: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            reason: reason.into(),
        }
    }
}

/// Operator-supplied admission predicate, evaluated inside the run loop
#[async_trait]
pub trait DealFilter: Send + Sync {
    async fn evaluate(&self, params: &FilterParams) -> Result<FilterDecision>;
}
