//! Throughput sampling for active transfers

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::coordination::ShutdownToken;
use crate::provider::TransferProgress;

#[derive(Debug)]
struct TransferStats {
    progress: TransferProgress,
    sampled_bytes: u64,
    sampled_at: Instant,
    /// Bytes per second over the last sample period
    rate: f64,
}

/// Bytes received and sampled rate per active transfer
#[derive(Debug)]
pub struct DealTransfers {
    sample_period: Duration,
    transfers: DashMap<Uuid, TransferStats>,
}

impl DealTransfers {
    pub fn new(sample_period: Duration) -> Self {
        Self {
            sample_period,
            transfers: DashMap::new(),
        }
    }

    /// Start tracking a transfer; the transport bumps the returned counter.
    pub fn register(&self, deal_uuid: Uuid) -> TransferProgress {
        let progress = Arc::new(AtomicU64::new(0));
        self.transfers.insert(
            deal_uuid,
            TransferStats {
                progress: Arc::clone(&progress),
                sampled_bytes: 0,
                sampled_at: Instant::now(),
                rate: 0.0,
            },
        );
        progress
    }

    pub fn complete(&self, deal_uuid: Uuid) {
        self.transfers.remove(&deal_uuid);
    }

    pub fn transferred(&self, deal_uuid: Uuid) -> Option<u64> {
        self.transfers
            .get(&deal_uuid)
            .map(|s| s.progress.load(Ordering::Relaxed))
    }

    pub fn rate(&self, deal_uuid: Uuid) -> Option<f64> {
        self.transfers.get(&deal_uuid).map(|s| s.rate)
    }

    pub fn aggregate_rate(&self) -> f64 {
        self.transfers.iter().map(|s| s.rate).sum()
    }

    pub fn active(&self) -> usize {
        self.transfers.len()
    }

    /// Refresh per-transfer rates from the byte counters
    pub fn sample(&self) {
        let now = Instant::now();
        for mut stats in self.transfers.iter_mut() {
            let bytes = stats.progress.load(Ordering::Relaxed);
            let elapsed = now.duration_since(stats.sampled_at).as_secs_f64();
            if elapsed > 0.0 {
                stats.rate = bytes.saturating_sub(stats.sampled_bytes) as f64 / elapsed;
            }
            stats.sampled_bytes = bytes;
            stats.sampled_at = now;
        }
    }

    /// Background sampler. Returns when shutdown is requested.
    pub async fn start(self: Arc<Self>, shutdown: ShutdownToken) {
        let mut tick = tokio::time::interval(self.sample_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.sample();
                    if self.active() > 0 {
                        debug!(
                            active = self.active(),
                            bytes_per_sec = self.aggregate_rate() as u64,
                            "transfer throughput"
                        );
                    }
                }
            }
        }

        info!("transfer sampler stopped");
    }
}
