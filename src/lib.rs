pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod deal_log;
pub mod domain;
pub mod error;
pub mod execution;
pub mod filter;
pub mod provider;
pub mod transfer;
pub mod validation;

pub use config::AppConfig;
pub use coordination::{ShutdownController, ShutdownToken};
pub use deal_log::{DealLogEvent, DealLogger, MemoryDealLogger, TracingDealLogger};
pub use domain::{Checkpoint, DealParams, ProviderDeal, RetryPolicy};
pub use error::{ProvdError, Result};
pub use provider::{DealRejectionInfo, Provider, ProviderConfig, ProviderDeps};
