//! Data transfer admission and throughput tracking

pub mod limiter;
pub mod sampler;

pub use limiter::{TransferLimiter, TransferLimiterConfig, TransferPermit};
pub use sampler::DealTransfers;
