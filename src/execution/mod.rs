//! Per-deal execution

pub mod commit;
pub mod pipeline;

pub use commit::{commit_with_retry, CommitRetry};
pub use pipeline::{retry_policy_for, run_pipeline, ExecutionContext};
