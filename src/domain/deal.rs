use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

use super::checkpoint::Checkpoint;
use super::retry::RetryPolicy;
use crate::error::{ProvdError, Result};

/// Slot number assigned by the committing subsystem
pub type SlotNumber = u64;

/// Storage deal terms agreed between client and provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealProposal {
    /// Content identifier of the piece
    pub piece_cid: String,
    /// Padded piece size in bytes
    pub piece_size: u64,
    pub client: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub storage_price_per_epoch: Decimal,
    pub provider_collateral: Decimal,
    pub client_collateral: Decimal,
    #[serde(default)]
    pub verified_deal: bool,
}

impl DealProposal {
    pub fn duration(&self) -> i64 {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_price(&self) -> Decimal {
        self.storage_price_per_epoch * Decimal::from(self.duration().max(0))
    }
}

/// Proposal plus the client's signature over it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub proposal: DealProposal,
    pub client_signature: String,
}

impl SignedProposal {
    /// Content id: sha256 over the canonical JSON encoding
    pub fn proposal_id(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// How the payload reaches the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferParams {
    /// Transport kind, e.g. "http"
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Raw (unpadded) payload size in bytes
    pub size: u64,
}

/// Deal parameters as received from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealParams {
    pub deal_uuid: Uuid,
    #[serde(default)]
    pub is_offline: bool,
    pub client_deal_proposal: SignedProposal,
    pub deal_data_root: String,
    pub transfer: TransferParams,
}

/// Placement assigned when the payload is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPlacement {
    pub slot: SlotNumber,
    pub offset: u64,
    /// Padded length of the piece inside the slot
    pub length: u64,
}

/// Provider-side deal state, persisted in the deal store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDeal {
    pub deal_uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub signed_proposal_id: String,
    pub client_deal_proposal: SignedProposal,
    pub client_peer_id: String,
    pub deal_data_root: String,
    pub transfer: TransferParams,
    /// Where the payload lives locally; `None` for offline deals awaiting import
    pub inbound_file_path: Option<PathBuf>,
    pub is_offline: bool,
    pub checkpoint: Checkpoint,
    pub checkpoint_at: DateTime<Utc>,
    pub retry: RetryPolicy,
    pub err: Option<String>,
    pub publish_cid: Option<String>,
    pub chain_deal_id: Option<u64>,
    pub placement: Option<SlotPlacement>,
    /// Temp files removed and reservations released after the deal finished
    pub cleanup_done: bool,
}

impl ProviderDeal {
    pub fn from_params(params: DealParams, client_peer_id: impl Into<String>) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            deal_uuid: params.deal_uuid,
            created_at: now,
            signed_proposal_id: params.client_deal_proposal.proposal_id()?,
            client_deal_proposal: params.client_deal_proposal,
            client_peer_id: client_peer_id.into(),
            deal_data_root: params.deal_data_root,
            transfer: params.transfer,
            inbound_file_path: None,
            is_offline: params.is_offline,
            checkpoint: Checkpoint::Accepted,
            checkpoint_at: now,
            retry: RetryPolicy::Auto,
            err: None,
            publish_cid: None,
            chain_deal_id: None,
            placement: None,
            cleanup_done: false,
        })
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }

    /// Storage to reserve: the padded piece size
    pub fn storage_size(&self) -> u64 {
        self.proposal().piece_size
    }

    /// Move the deal forward, refusing regressions and skipped steps.
    pub fn advance(&mut self, to: Checkpoint) -> Result<()> {
        if !self.checkpoint.can_transition_to(to) {
            return Err(ProvdError::InvalidCheckpointTransition {
                from: self.checkpoint,
                to,
            });
        }
        if self.checkpoint != to {
            self.checkpoint = to;
            self.checkpoint_at = Utc::now();
        }
        Ok(())
    }

    /// Terminate the deal: checkpoint `Complete` with the error recorded.
    pub fn fail(&mut self, err: impl Into<String>) -> Result<()> {
        self.err = Some(err.into());
        self.retry = RetryPolicy::Fatal;
        self.advance(Checkpoint::Complete)
    }

    pub fn is_terminal(&self) -> bool {
        self.checkpoint.is_terminal()
    }

    /// Offline deal whose data has not been imported yet
    pub fn awaiting_import(&self) -> bool {
        self.is_offline && self.inbound_file_path.is_none()
    }
}
