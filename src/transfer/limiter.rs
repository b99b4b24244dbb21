//! Transfer concurrency limiter
//!
//! Admission to the network transport is bounded by a semaphore. Each
//! admitted transfer holds a [`TransferPermit`]; dropping it (on success,
//! failure, cancellation or panic) frees the slot. A background loop watches
//! admitted transfers and reports the ones that stopped making progress.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordination::ShutdownToken;
use crate::error::{ProvdError, Result};
use crate::provider::TransferProgress;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferLimiterConfig {
    /// Maximum simultaneous transfers
    pub max_concurrent: usize,
    /// How often admitted transfers are checked for stalls
    #[serde(with = "crate::config::duration_secs")]
    pub stall_check_period: Duration,
    /// A transfer with no new bytes for this long is reported as stalled
    #[serde(with = "crate::config::duration_secs")]
    pub stall_timeout: Duration,
}

impl Default for TransferLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            stall_check_period: Duration::from_secs(15),
            stall_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
struct ActiveTransfer {
    progress: TransferProgress,
    admitted_at: Instant,
    last_bytes: u64,
    last_progress_at: Instant,
    stalled: bool,
}

#[derive(Debug)]
pub struct TransferLimiter {
    config: TransferLimiterConfig,
    slots: Arc<Semaphore>,
    active: Arc<DashMap<Uuid, ActiveTransfer>>,
}

impl TransferLimiter {
    pub fn new(config: TransferLimiterConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            slots,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Wait for a free transfer slot. Fails with `Cancelled` on shutdown.
    pub async fn acquire(
        &self,
        deal_uuid: Uuid,
        progress: TransferProgress,
        shutdown: &ShutdownToken,
    ) -> Result<TransferPermit> {
        let permit = shutdown
            .run_until_cancelled(self.slots.clone().acquire_owned())
            .await?
            .map_err(|_| ProvdError::Internal("transfer limiter closed".into()))?;

        let now = Instant::now();
        let bytes = progress.load(Ordering::Relaxed);
        self.active.insert(
            deal_uuid,
            ActiveTransfer {
                progress,
                admitted_at: now,
                last_bytes: bytes,
                last_progress_at: now,
                stalled: false,
            },
        );
        debug!(%deal_uuid, available = self.available(), "transfer admitted");

        Ok(TransferPermit {
            deal_uuid,
            active: Arc::clone(&self.active),
            _permit: permit,
        })
    }

    /// Free transfer slots
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Deals currently flagged as stalled
    pub fn stalled(&self) -> Vec<Uuid> {
        self.active
            .iter()
            .filter(|entry| entry.stalled)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Mark transfers without progress for longer than the stall timeout.
    /// Returns the deals that became stalled on this pass.
    pub fn check_stalls(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut newly_stalled = Vec::new();

        for mut entry in self.active.iter_mut() {
            let bytes = entry.progress.load(Ordering::Relaxed);
            if bytes != entry.last_bytes {
                entry.last_bytes = bytes;
                entry.last_progress_at = now;
                if entry.stalled {
                    info!(deal_uuid = %entry.key(), bytes, "stalled transfer resumed");
                }
                entry.stalled = false;
                continue;
            }

            let idle = now.duration_since(entry.last_progress_at);
            if !entry.stalled && idle >= self.config.stall_timeout {
                entry.stalled = true;
                warn!(
                    deal_uuid = %entry.key(),
                    bytes,
                    idle_secs = idle.as_secs(),
                    running_secs = now.duration_since(entry.admitted_at).as_secs(),
                    "transfer stalled"
                );
                newly_stalled.push(*entry.key());
            }
        }
        newly_stalled
    }

    /// Background stall watcher. Returns when shutdown is requested.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownToken) {
        let mut tick = tokio::time::interval(self.config.stall_check_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            max_concurrent = self.config.max_concurrent,
            "transfer limiter started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.check_stalls();
                }
            }
        }

        info!("transfer limiter stopped");
    }
}

/// Scoped transfer admission
#[derive(Debug)]
pub struct TransferPermit {
    deal_uuid: Uuid,
    active: Arc<DashMap<Uuid, ActiveTransfer>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.active.remove(&self.deal_uuid);
    }
}
