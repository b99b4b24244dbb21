//! Provider runtime configuration

use rust_decimal::Decimal;
use std::path::PathBuf;
use std::time::Duration;

use crate::transfer::TransferLimiterConfig;

/// Runtime view of the provider settings, built from `AppConfig`
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Our on-chain address; proposals addressed elsewhere are rejected
    pub address: String,
    /// Directory holding inbound payloads of online deals
    pub staging_dir: PathBuf,
    /// Fee reserved from the funds pool for publishing each deal
    pub publish_fee: Decimal,
    /// Hard ceiling on a single data transfer
    pub max_transfer_duration: Duration,
    /// Back-off between commit attempts while slots are saturated
    pub commit_retry_wait: Duration,
    /// Total time budget for commit retries
    pub commit_retry_timeout: Duration,
    /// How often a committed slot is polled until it is final
    pub slot_poll_interval: Duration,
    /// Deal duration bounds in epochs
    pub min_deal_duration: i64,
    pub max_deal_duration: i64,
    pub max_piece_size: u64,
    pub transfer_limiter: TransferLimiterConfig,
    /// Throughput sampling period for active transfers
    pub transfer_sample_period: Duration,
    /// Capacity of per-deal update and new-deal broadcast channels
    pub broadcast_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            address: "f01000".to_string(),
            staging_dir: std::env::temp_dir().join("provd-staging"),
            publish_fee: Decimal::ZERO,
            max_transfer_duration: Duration::from_secs(24 * 3600),
            commit_retry_wait: Duration::from_secs(60),
            commit_retry_timeout: Duration::from_secs(6 * 3600),
            slot_poll_interval: Duration::from_secs(30),
            min_deal_duration: 180 * 2880,
            max_deal_duration: 540 * 2880,
            max_piece_size: 64 << 30,
            transfer_limiter: TransferLimiterConfig::default(),
            transfer_sample_period: Duration::from_secs(5),
            broadcast_capacity: 64,
        }
    }
}
