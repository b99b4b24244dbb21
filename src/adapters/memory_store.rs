use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{Checkpoint, ProviderDeal};
use crate::error::{ProvdError, Result};
use crate::provider::DealStore;

/// Deal store kept in process memory. Used for development and tests; a
/// restart is simulated by sharing one instance between providers.
#[derive(Debug, Default)]
pub struct MemoryDealStore {
    deals: RwLock<HashMap<Uuid, ProviderDeal>>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a deal without any checks (test setup)
    pub async fn put(&self, deal: ProviderDeal) {
        self.deals.write().await.insert(deal.deal_uuid, deal);
    }

    pub async fn len(&self) -> usize {
        self.deals.read().await.len()
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, deal: &ProviderDeal) -> Result<()> {
        let mut deals = self.deals.write().await;
        if deals.contains_key(&deal.deal_uuid) {
            return Err(ProvdError::DealAlreadyExists(deal.deal_uuid));
        }
        deals.insert(deal.deal_uuid, deal.clone());
        Ok(())
    }

    async fn update(&self, deal: &ProviderDeal) -> Result<()> {
        let mut deals = self.deals.write().await;
        match deals.get_mut(&deal.deal_uuid) {
            Some(existing) => {
                *existing = deal.clone();
                Ok(())
            }
            None => Err(ProvdError::DealNotFound(deal.deal_uuid)),
        }
    }

    async fn by_id(&self, deal_uuid: Uuid) -> Result<ProviderDeal> {
        self.deals
            .read()
            .await
            .get(&deal_uuid)
            .cloned()
            .ok_or(ProvdError::DealNotFound(deal_uuid))
    }

    async fn by_signed_proposal(&self, proposal_id: &str) -> Result<ProviderDeal> {
        self.deals
            .read()
            .await
            .values()
            .find(|d| d.signed_proposal_id == proposal_id)
            .cloned()
            .ok_or_else(|| ProvdError::DealNotFoundByProposal(proposal_id.to_string()))
    }

    async fn list_active(&self) -> Result<Vec<ProviderDeal>> {
        let mut active: Vec<_> = self
            .deals
            .read()
            .await
            .values()
            .filter(|d| d.checkpoint != Checkpoint::Complete)
            .cloned()
            .collect();
        active.sort_by_key(|d| d.created_at);
        Ok(active)
    }

    async fn list_completed(&self) -> Result<Vec<ProviderDeal>> {
        let mut completed: Vec<_> = self
            .deals
            .read()
            .await
            .values()
            .filter(|d| d.checkpoint == Checkpoint::Complete && !d.cleanup_done)
            .cloned()
            .collect();
        completed.sort_by_key(|d| d.created_at);
        Ok(completed)
    }
}
