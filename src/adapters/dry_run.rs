//! Chain-less publisher and announcer
//!
//! Used when the provider runs without a chain client: publishing derives a
//! deterministic reference from the proposal and confirmation hands out
//! sequential deal ids. Announcements only go to the log.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::domain::ProviderDeal;
use crate::error::Result;
use crate::provider::{Announcer, DealPublisher};

#[derive(Debug)]
pub struct DryRunPublisher {
    confirm_delay: Duration,
    next_deal_id: AtomicU64,
}

impl DryRunPublisher {
    pub fn new(confirm_delay: Duration) -> Self {
        Self {
            confirm_delay,
            next_deal_id: AtomicU64::new(1),
        }
    }
}

impl Default for DryRunPublisher {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait]
impl DealPublisher for DryRunPublisher {
    async fn publish(&self, deal: &ProviderDeal) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(deal.signed_proposal_id.as_bytes());
        hasher.update(deal.deal_uuid.as_bytes());
        let publish_cid = format!("dryrun-{}", hex::encode(hasher.finalize()));
        info!(deal_uuid = %deal.deal_uuid, %publish_cid, "dry-run publish");
        Ok(publish_cid)
    }

    async fn wait_for_publish(&self, publish_cid: &str) -> Result<u64> {
        if !self.confirm_delay.is_zero() {
            tokio::time::sleep(self.confirm_delay).await;
        }
        let deal_id = self.next_deal_id.fetch_add(1, Ordering::SeqCst);
        info!(%publish_cid, deal_id, "dry-run publish confirmed");
        Ok(deal_id)
    }
}

/// Writes announcements to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce(&self, deal: &ProviderDeal) -> Result<()> {
        info!(
            deal_uuid = %deal.deal_uuid,
            piece_cid = %deal.proposal().piece_cid,
            slot = deal.placement.map(|p| p.slot),
            "deal announced"
        );
        Ok(())
    }
}
