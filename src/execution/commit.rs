//! Bounded retry around payload commits
//!
//! The committing subsystem answers `SlotsSaturated` while too many slots
//! are in flight. That one error is retried after a fixed wait until the
//! time budget runs out; anything else fails the commit immediately.

use std::time::Duration;
use tokio::time::Instant;

use crate::coordination::ShutdownToken;
use crate::deal_log::{DealLogEvent, DealLogger};
use crate::domain::{ProviderDeal, SlotPlacement};
use crate::error::{ProvdError, Result};
use crate::provider::{CommitInfo, PieceCommitter};

#[derive(Debug, Clone, Copy)]
pub struct CommitRetry {
    pub wait: Duration,
    pub timeout: Duration,
}

/// Commit the deal's inbound payload, retrying while slots are saturated.
///
/// Returns `Cancelled` if shutdown interrupts a wait, and `Commit` when the
/// subsystem fails for any other reason or the budget is exhausted.
pub async fn commit_with_retry(
    committer: &dyn PieceCommitter,
    logger: &dyn DealLogger,
    retry: CommitRetry,
    deal: &ProviderDeal,
    shutdown: &ShutdownToken,
) -> Result<SlotPlacement> {
    let path = deal
        .inbound_file_path
        .as_ref()
        .ok_or_else(|| ProvdError::Commit("deal has no inbound payload".into()))?;
    let publish_cid = deal
        .publish_cid
        .clone()
        .ok_or_else(|| ProvdError::Commit("deal has not been published".into()))?;

    let proposal = deal.proposal();
    let info = CommitInfo {
        deal_uuid: deal.deal_uuid,
        chain_deal_id: deal.chain_deal_id,
        publish_cid,
        piece_cid: proposal.piece_cid.clone(),
        start_epoch: proposal.start_epoch,
        end_epoch: proposal.end_epoch,
    };

    let started = Instant::now();
    loop {
        let payload = tokio::fs::File::open(path).await.map_err(|e| {
            ProvdError::Commit(format!("failed to open payload {}: {}", path.display(), e))
        })?;

        match committer
            .commit(deal.transfer.size, Box::new(payload), &info)
            .await
        {
            Ok((slot, offset)) => {
                logger.log(deal.deal_uuid, DealLogEvent::Committed { slot, offset });
                return Ok(SlotPlacement {
                    slot,
                    offset,
                    length: proposal.piece_size,
                });
            }
            Err(ProvdError::SlotsSaturated) => {
                if started.elapsed() >= retry.timeout {
                    return Err(ProvdError::Commit(format!(
                        "slots still saturated after {:?}",
                        retry.timeout
                    )));
                }
                logger.log(
                    deal.deal_uuid,
                    DealLogEvent::CommitRetry {
                        error: ProvdError::SlotsSaturated.to_string(),
                    },
                );
                shutdown
                    .run_until_cancelled(tokio::time::sleep(retry.wait))
                    .await?;
            }
            Err(ProvdError::Cancelled) => return Err(ProvdError::Cancelled),
            Err(e) => return Err(ProvdError::Commit(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ShutdownController;
    use crate::deal_log::MemoryDealLogger;
    use crate::domain::fixtures;
    use crate::provider::MockPieceCommitter;
    use mockall::Sequence;

    fn committed_deal(dir: &tempfile::TempDir) -> ProviderDeal {
        let path = dir.path().join("payload.car");
        std::fs::write(&path, b"payload").unwrap();
        let mut deal = fixtures::deal(1024);
        deal.inbound_file_path = Some(path);
        deal.publish_cid = Some("bafypublish".into());
        deal.chain_deal_id = Some(42);
        deal
    }

    fn retry() -> CommitRetry {
        CommitRetry {
            wait: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_saturation_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let deal = committed_deal(&dir);
        let logger = MemoryDealLogger::new();
        let shutdown = ShutdownController::new();

        let mut committer = MockPieceCommitter::new();
        let mut seq = Sequence::new();
        committer
            .expect_commit()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(ProvdError::SlotsSaturated));
        committer
            .expect_commit()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|size, _, info| *size == 512 && info.chain_deal_id == Some(42))
            .returning(|_, _, _| Ok((7, 2048)));

        let placement =
            commit_with_retry(&committer, &logger, retry(), &deal, &shutdown.token())
                .await
                .unwrap();

        assert_eq!(
            placement,
            SlotPlacement {
                slot: 7,
                offset: 2048,
                length: 1024
            }
        );
        let retries = logger
            .events_for(deal.deal_uuid)
            .into_iter()
            .filter(|e| matches!(e, DealLogEvent::CommitRetry { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let deal = committed_deal(&dir);
        let logger = MemoryDealLogger::new();
        let shutdown = ShutdownController::new();

        let mut committer = MockPieceCommitter::new();
        committer
            .expect_commit()
            .returning(|_, _, _| Err(ProvdError::SlotsSaturated));

        let err = commit_with_retry(&committer, &logger, retry(), &deal, &shutdown.token())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvdError::Commit(_)));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let deal = committed_deal(&dir);
        let logger = MemoryDealLogger::new();
        let shutdown = ShutdownController::new();

        let mut committer = MockPieceCommitter::new();
        committer
            .expect_commit()
            .times(1)
            .returning(|_, _, _| Err(ProvdError::Internal("disk on fire".into())));

        let err = commit_with_retry(&committer, &logger, retry(), &deal, &shutdown.token())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert!(logger.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let dir = tempfile::tempdir().unwrap();
        let deal = committed_deal(&dir);
        let logger = MemoryDealLogger::new();
        let shutdown = ShutdownController::new();

        let mut committer = MockPieceCommitter::new();
        committer
            .expect_commit()
            .returning(|_, _, _| Err(ProvdError::SlotsSaturated));

        let slow = CommitRetry {
            wait: Duration::from_secs(3600),
            timeout: Duration::from_secs(7200),
        };
        let token = shutdown.token();
        let task = tokio::spawn(async move {
            commit_with_retry(&committer, &logger, slow, &deal, &token).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("commit should return promptly")
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_requires_publish_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut deal = committed_deal(&dir);
        deal.publish_cid = None;
        let committer = MockPieceCommitter::new();
        let err = commit_with_retry(
            &committer,
            &MemoryDealLogger::new(),
            retry(),
            &deal,
            &ShutdownController::new().token(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvdError::Commit(_)));
    }
}
