use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapters::CommitterConfig;
use crate::provider::ProviderConfig;
use crate::transfer::TransferLimiterConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub provider: ProviderSection,
    #[serde(default)]
    pub transfer_limiter: TransferLimiterConfig,
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub committer: CommitterConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    /// Our on-chain address
    pub address: String,
    /// Where inbound payloads of online deals are written
    pub staging_dir: PathBuf,
    #[serde(default)]
    pub publish_fee: Decimal,
    #[serde(with = "duration_secs", default = "default_max_transfer_duration")]
    pub max_transfer_duration: Duration,
    #[serde(with = "duration_secs", default = "default_commit_retry_wait")]
    pub commit_retry_wait: Duration,
    #[serde(with = "duration_secs", default = "default_commit_retry_timeout")]
    pub commit_retry_timeout: Duration,
    #[serde(with = "duration_secs", default = "default_slot_poll_interval")]
    pub slot_poll_interval: Duration,
    /// Deal duration bounds in epochs
    #[serde(default = "default_min_deal_duration")]
    pub min_deal_duration: i64,
    #[serde(default = "default_max_deal_duration")]
    pub max_deal_duration: i64,
    #[serde(default = "default_max_piece_size")]
    pub max_piece_size: u64,
    /// Throughput sampling period for active transfers
    #[serde(with = "duration_secs", default = "default_sample_period")]
    pub transfer_sample_period: Duration,
}

fn default_max_transfer_duration() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_commit_retry_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_commit_retry_timeout() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_slot_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_min_deal_duration() -> i64 {
    180 * 2880
}

fn default_max_deal_duration() -> i64 {
    540 * 2880
}

fn default_max_piece_size() -> u64 {
    64 << 30
}

fn default_sample_period() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Storage ceiling in bytes shared by all in-flight deals
    pub storage_capacity: u64,
    /// Funds available for collateral and publish fees
    pub funds_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// External program consulted for every proposal; none accepts all
    #[serde(default)]
    pub command: Option<String>,
    #[serde(with = "duration_secs", default = "default_filter_timeout")]
    pub timeout: Duration,
}

fn default_filter_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout: default_filter_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; deals are kept in memory when unset
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Bearer token required on mutating routes
    #[serde(default)]
    pub token: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("provider.address", "f01000")?
            .set_default("provider.staging_dir", "data/staging")?
            .set_default("resources.storage_capacity", 1u64 << 40)?
            .set_default("resources.funds_balance", "0")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PROVD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // PROVD_PROVIDER__ADDRESS, PROVD_RESOURCES__STORAGE_CAPACITY, ...
            .add_source(
                Environment::with_prefix("PROVD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Runtime view handed to the provider
    pub fn to_provider_config(&self) -> ProviderConfig {
        let p = &self.provider;
        ProviderConfig {
            address: p.address.clone(),
            staging_dir: p.staging_dir.clone(),
            publish_fee: p.publish_fee,
            max_transfer_duration: p.max_transfer_duration,
            commit_retry_wait: p.commit_retry_wait,
            commit_retry_timeout: p.commit_retry_timeout,
            slot_poll_interval: p.slot_poll_interval,
            min_deal_duration: p.min_deal_duration,
            max_deal_duration: p.max_deal_duration,
            max_piece_size: p.max_piece_size,
            transfer_limiter: self.transfer_limiter.clone(),
            transfer_sample_period: p.transfer_sample_period,
            ..ProviderConfig::default()
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.provider.address.trim().is_empty() {
            errors.push("provider.address must not be empty".to_string());
        }
        if self.provider.min_deal_duration > self.provider.max_deal_duration {
            errors.push("provider.min_deal_duration exceeds max_deal_duration".to_string());
        }
        if !self.provider.max_piece_size.is_power_of_two() {
            errors.push("provider.max_piece_size must be a power of two".to_string());
        }
        if self.provider.publish_fee < Decimal::ZERO {
            errors.push("provider.publish_fee must not be negative".to_string());
        }
        if self.resources.funds_balance < Decimal::ZERO {
            errors.push("resources.funds_balance must not be negative".to_string());
        }
        if self.transfer_limiter.max_concurrent == 0 {
            errors.push("transfer_limiter.max_concurrent must be positive".to_string());
        }
        if self.committer.max_pending == 0 {
            errors.push("committer.max_pending must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Serde adapter storing a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
