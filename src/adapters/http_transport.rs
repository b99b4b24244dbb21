use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::domain::ProviderDeal;
use crate::error::{ProvdError, Result};
use crate::provider::{TransferProgress, Transport};

/// Pulls deal payloads over HTTP(S) into the staging area
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    /// `connect_timeout` bounds connection setup only; the overall transfer
    /// duration is enforced by the caller.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProvdError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn transfer(
        &self,
        deal: &ProviderDeal,
        dest: &Path,
        progress: TransferProgress,
    ) -> Result<u64> {
        let url = deal
            .transfer
            .url
            .as_deref()
            .ok_or_else(|| ProvdError::Transfer("deal has no transfer url".into()))?;
        if deal.transfer.kind != "http" && deal.transfer.kind != "https" {
            return Err(ProvdError::Transfer(format!(
                "unsupported transfer kind {}",
                deal.transfer.kind
            )));
        }

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProvdError::Transfer(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProvdError::Transfer(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ProvdError::Transfer(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.store(written, Ordering::Relaxed);
            if written > deal.transfer.size {
                return Err(ProvdError::Transfer(format!(
                    "received more than the expected {} bytes",
                    deal.transfer.size
                )));
            }
        }
        file.flush().await?;

        debug!(deal_uuid = %deal.deal_uuid, bytes = written, "payload downloaded");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rejects_missing_url_and_unknown_kind() {
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.car");

        let mut deal = fixtures::deal(1024);
        deal.transfer.url = None;
        let err = transport
            .transfer(&deal, &dest, Arc::new(AtomicU64::new(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvdError::Transfer(_)));

        let mut deal = fixtures::deal(1024);
        deal.transfer.kind = "libp2p".into();
        let err = transport
            .transfer(&deal, &dest, Arc::new(AtomicU64::new(0)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported transfer kind"));
    }
}
