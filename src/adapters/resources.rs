//! In-process reservation pools
//!
//! Storage capacity and funds ledgers keyed by deal id. Both pools hold at
//! most one tag per deal and treat untagging an unknown deal as a no-op.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProvdError, Result};
use crate::provider::{CapacityManager, FundsManager, StorageSpace};

#[derive(Debug, Default)]
struct CapacityState {
    total: u64,
    tags: HashMap<Uuid, u64>,
}

impl CapacityState {
    fn tagged(&self) -> u64 {
        self.tags.values().sum()
    }
}

/// Storage capacity pool with a fixed ceiling
#[derive(Debug)]
pub struct MemoryCapacityManager {
    state: RwLock<CapacityState>,
}

impl MemoryCapacityManager {
    pub fn new(total: u64) -> Self {
        Self {
            state: RwLock::new(CapacityState {
                total,
                tags: HashMap::new(),
            }),
        }
    }

    /// Bytes tagged for one deal, if any
    pub async fn tagged_for(&self, deal_uuid: Uuid) -> Option<u64> {
        self.state.read().await.tags.get(&deal_uuid).copied()
    }
}

#[async_trait]
impl CapacityManager for MemoryCapacityManager {
    async fn tag(&self, deal_uuid: Uuid, size: u64) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.tags.get(&deal_uuid) {
            if *existing == size {
                return Ok(());
            }
            return Err(ProvdError::Internal(format!(
                "deal {} already has {} bytes tagged",
                deal_uuid, existing
            )));
        }

        let free = state.total.saturating_sub(state.tagged());
        if size > free {
            return Err(ProvdError::InsufficientCapacity {
                requested: size,
                free,
            });
        }

        state.tags.insert(deal_uuid, size);
        debug!(%deal_uuid, size, free = free - size, "tagged storage space");
        Ok(())
    }

    async fn untag(&self, deal_uuid: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(size) = state.tags.remove(&deal_uuid) {
            debug!(%deal_uuid, size, "untagged storage space");
        }
        Ok(())
    }

    async fn space(&self) -> Result<StorageSpace> {
        let state = self.state.read().await;
        let tagged = state.tagged();
        Ok(StorageSpace {
            total: state.total,
            tagged,
            free: state.total.saturating_sub(tagged),
        })
    }

    async fn set_total(&self, total: u64) -> Result<()> {
        self.state.write().await.total = total;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FundsState {
    balance: Decimal,
    tags: HashMap<Uuid, (Decimal, Decimal)>,
}

impl FundsState {
    fn tagged(&self) -> Decimal {
        self.tags.values().map(|(c, p)| *c + *p).sum()
    }
}

/// Funds pool: collateral and publish fees drawn from one balance
#[derive(Debug)]
pub struct MemoryFundsManager {
    state: RwLock<FundsState>,
}

impl MemoryFundsManager {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: RwLock::new(FundsState {
                balance,
                tags: HashMap::new(),
            }),
        }
    }

    pub async fn tagged_for(&self, deal_uuid: Uuid) -> Option<(Decimal, Decimal)> {
        self.state.read().await.tags.get(&deal_uuid).copied()
    }
}

#[async_trait]
impl FundsManager for MemoryFundsManager {
    async fn tag(&self, deal_uuid: Uuid, collateral: Decimal, publish_fee: Decimal) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tags.contains_key(&deal_uuid) {
            return Ok(());
        }

        let required = collateral + publish_fee;
        let available = state.balance - state.tagged();
        if required > available {
            return Err(ProvdError::InsufficientFunds {
                required,
                available,
            });
        }

        state.tags.insert(deal_uuid, (collateral, publish_fee));
        debug!(%deal_uuid, %collateral, %publish_fee, "tagged funds");
        Ok(())
    }

    async fn untag(&self, deal_uuid: Uuid) -> Result<(Decimal, Decimal)> {
        let mut state = self.state.write().await;
        Ok(state
            .tags
            .remove(&deal_uuid)
            .unwrap_or((Decimal::ZERO, Decimal::ZERO)))
    }

    async fn available(&self) -> Result<Decimal> {
        let state = self.state.read().await;
        Ok(state.balance - state.tagged())
    }
}
