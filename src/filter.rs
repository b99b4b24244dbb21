//! Deal filters
//!
//! [`CommandFilter`] runs an operator-supplied program for every proposal.
//! The program receives the filter parameters as JSON on stdin; exit code 0
//! accepts the deal, any other exit code rejects it with stdout as the reason.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProvdError, Result};
use crate::provider::{DealFilter, FilterDecision, FilterParams};

/// Accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllFilter;

#[async_trait]
impl DealFilter for AcceptAllFilter {
    async fn evaluate(&self, _params: &FilterParams) -> Result<FilterDecision> {
        Ok(FilterDecision::accept())
    }
}

#[derive(Debug, Clone)]
pub struct CommandFilter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandFilter {
    /// Split `command` on whitespace into program and arguments
    pub fn new(command: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ProvdError::Filter("empty filter command".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvdError::Filter(format!("failed to run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // The program may decide without reading its input
            match stdin.write_all(&input).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl DealFilter for CommandFilter {
    async fn evaluate(&self, params: &FilterParams) -> Result<FilterDecision> {
        let input = serde_json::to_vec(params)?;
        let output = tokio::time::timeout(self.timeout, self.run(input))
            .await
            .map_err(|_| ProvdError::Filter(format!("filter timed out after {:?}", self.timeout)))??;

        let reason = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(
            deal_uuid = %params.deal.deal_uuid,
            status = ?output.status.code(),
            "deal filter finished"
        );
        if output.status.success() {
            Ok(FilterDecision::accept())
        } else {
            Ok(FilterDecision::reject(reason))
        }
    }
}
