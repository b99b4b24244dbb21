//! Startup recovery
//!
//! Runs once before the run loop serves its first request. Finished deals
//! whose cleanup was interrupted are cleaned up; active deals tag their
//! reservations in the pools again, get their handler back and are resumed
//! or parked according to their retry policy. Only failing to read the deal
//! lists aborts startup.

use tracing::{debug, info, warn};

use super::run_loop::{remove_inbound_file, RunLoop};
use super::state::Reservation;
use crate::deal_log::DealLogEvent;
use crate::domain::{retry_action, Checkpoint, ProviderDeal, RetryAction, RetryTrigger};
use crate::error::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub cleaned: usize,
    pub resumed: usize,
    pub parked: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunLoop {
    pub async fn recover(&mut self) -> Result<RecoveryReport> {
        let store = self.ctx.deps.store.clone();
        store.init().await?;

        let mut report = RecoveryReport::default();
        for deal in store.list_completed().await? {
            self.cleanup_finished(deal).await;
            report.cleaned += 1;
        }

        for deal in store.list_active().await? {
            self.recover_active(deal, &mut report).await;
        }

        info!(
            cleaned = report.cleaned,
            resumed = report.resumed,
            parked = report.parked,
            skipped = report.skipped,
            failed = report.failed,
            "deal recovery complete"
        );
        Ok(report)
    }

    /// Remove leftover payloads and release both pools for a finished deal.
    /// Untagging is idempotent, so it is safe to repeat after a crash.
    async fn cleanup_finished(&mut self, mut deal: ProviderDeal) -> ProviderDeal {
        let deal_uuid = deal.deal_uuid;
        let deps = &self.ctx.deps;

        remove_inbound_file(&deal).await;
        match deps.capacity.untag(deal_uuid).await {
            Ok(()) => deps.logger.log(deal_uuid, DealLogEvent::StorageUntagged),
            Err(e) => deps.logger.log(
                deal_uuid,
                DealLogEvent::UntagFailed {
                    error: e.to_string(),
                },
            ),
        }
        match deps.funds.untag(deal_uuid).await {
            Ok((collateral, publish_fee)) => deps.logger.log(
                deal_uuid,
                DealLogEvent::FundsUntagged {
                    collateral,
                    publish_fee,
                },
            ),
            Err(e) => deps.logger.log(
                deal_uuid,
                DealLogEvent::UntagFailed {
                    error: e.to_string(),
                },
            ),
        }
        self.reservations.take(deal_uuid);

        deal.cleanup_done = true;
        if let Err(e) = deps.store.update(&deal).await {
            warn!(%deal_uuid, error = %e, "failed to record deal cleanup");
        }
        deal
    }

    async fn recover_active(&mut self, mut deal: ProviderDeal, report: &mut RecoveryReport) {
        let deal_uuid = deal.deal_uuid;

        if deal.checkpoint >= Checkpoint::CommittedAndAnnounced {
            if !deal.cleanup_done {
                deal = self.cleanup_finished(deal).await;
            }
            match deal.placement {
                None => warn!(
                    %deal_uuid,
                    checkpoint = %deal.checkpoint,
                    "announced deal has no slot placement, resuming it to surface the error"
                ),
                Some(placement) => match self.ctx.deps.committer.slot_status(placement.slot).await {
                    Ok(state) if state.is_final() => {
                        info!(%deal_uuid, slot = placement.slot, ?state, "slot already final, not resuming deal");
                        report.skipped += 1;
                        return;
                    }
                    Ok(_) => {}
                    // Unknown status is retried by the resumed pipeline
                    Err(e) => warn!(
                        %deal_uuid,
                        slot = placement.slot,
                        error = %e,
                        "failed to check slot status, resuming deal"
                    ),
                },
            }
        } else {
            self.restore_reservations(&deal).await;
        }

        let handler = match self.registry.create(deal_uuid).await {
            Ok(handler) => handler,
            Err(e) => {
                self.ctx.deps.logger.log(
                    deal_uuid,
                    DealLogEvent::RestartFailed {
                        error: e.to_string(),
                    },
                );
                report.failed += 1;
                return;
            }
        };

        if deal.awaiting_import() {
            self.ctx
                .deps
                .logger
                .log(deal_uuid, DealLogEvent::AwaitingImport);
            report.parked += 1;
            return;
        }

        match retry_action(deal.retry, RetryTrigger::Restart) {
            RetryAction::Park | RetryAction::Fail => {
                self.ctx
                    .deps
                    .logger
                    .log(deal_uuid, DealLogEvent::AwaitingManualRetry);
                report.parked += 1;
            }
            RetryAction::Resume => {
                deal.err = None;
                self.ctx.deps.logger.log(
                    deal_uuid,
                    DealLogEvent::Resumed {
                        checkpoint: deal.checkpoint,
                    },
                );
                self.spawn_pipeline(&handler, deal);
                report.resumed += 1;
            }
        }
    }

    /// Tag a still-running deal's reservations in both pools again. The pools
    /// may have been rebuilt empty, and tagging is idempotent when they were not.
    async fn restore_reservations(&mut self, deal: &ProviderDeal) {
        let deal_uuid = deal.deal_uuid;
        let claim = Reservation::claimed_by(deal, self.ctx.config.publish_fee);
        let deps = &self.ctx.deps;

        if let Some((collateral, publish_fee)) = claim.funds {
            match deps.funds.tag(deal_uuid, collateral, publish_fee).await {
                Ok(()) => self
                    .reservations
                    .record_funds(deal_uuid, collateral, publish_fee),
                Err(e) => deps.logger.log(
                    deal_uuid,
                    DealLogEvent::RestartFailed {
                        error: format!("failed to restore funds reservation: {e}"),
                    },
                ),
            }
        }
        if let Some(size) = claim.storage {
            match deps.capacity.tag(deal_uuid, size).await {
                Ok(()) => self.reservations.record_storage(deal_uuid, size),
                Err(e) => deps.logger.log(
                    deal_uuid,
                    DealLogEvent::RestartFailed {
                        error: format!("failed to restore storage reservation: {e}"),
                    },
                ),
            }
        }
        debug!(%deal_uuid, storage = ?claim.storage, "reservations restored");
    }
}
