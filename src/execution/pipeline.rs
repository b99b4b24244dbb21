//! Per-deal execution pipeline
//!
//! Drives one deal from its persisted checkpoint to `Complete`:
//!
//! ```text
//! Accepted -> Transferred -> Published -> PublishConfirmed -> Committed
//!          -> CommittedAndAnnounced -> Complete
//! ```
//!
//! Every checkpoint is persisted and broadcast to the deal's subscribers.
//! Publication and completion are reported to the run loop, which owns the
//! reservations. A retryable failure parks the pipeline on the handler's
//! retry gate; a fatal one terminates the deal. On shutdown the pipeline
//! stops where it is and leaves the persisted state to recovery.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::commit::{commit_with_retry, CommitRetry};
use crate::coordination::ShutdownToken;
use crate::deal_log::DealLogEvent;
use crate::domain::{Checkpoint, ProviderDeal, RetryAction, RetryPolicy};
use crate::error::{ProvdError, Result};
use crate::provider::{DealHandler, PipelineGuard, ProviderConfig, ProviderDeps, RunLoopHandle};
use crate::transfer::{DealTransfers, TransferLimiter};

/// Everything a pipeline needs, shared by all running pipelines
pub struct ExecutionContext {
    pub config: ProviderConfig,
    pub deps: ProviderDeps,
    pub limiter: Arc<TransferLimiter>,
    pub transfers: Arc<DealTransfers>,
    pub run_loop: RunLoopHandle,
    pub shutdown: ShutdownToken,
}

/// Retry policy a failed step leaves the deal in
pub fn retry_policy_for(err: &ProvdError) -> RetryPolicy {
    match err {
        ProvdError::TransferTimeout(_)
        | ProvdError::TransferCancelled
        | ProvdError::InvalidCheckpointTransition { .. }
        | ProvdError::Validation(_) => RetryPolicy::Fatal,
        ProvdError::Commit(_) | ProvdError::SlotsSaturated => RetryPolicy::Manual,
        _ => RetryPolicy::Auto,
    }
}

enum Outcome {
    Finished,
    Cancelled,
}

/// Run the pipeline for `deal` until it finishes, fails, or shutdown.
pub async fn run_pipeline(ctx: Arc<ExecutionContext>, guard: PipelineGuard, mut deal: ProviderDeal) {
    let handler = Arc::clone(guard.handler());
    let deal_uuid = deal.deal_uuid;
    debug!(%deal_uuid, checkpoint = %deal.checkpoint, "pipeline started");

    loop {
        let err = match execute(&ctx, &handler, &mut deal).await {
            Ok(Outcome::Finished) | Ok(Outcome::Cancelled) => break,
            Err(ProvdError::Cancelled) => break,
            Err(e) => e,
        };

        let policy = retry_policy_for(&err);
        if policy == RetryPolicy::Fatal {
            fail_deal(&ctx, &handler, &mut deal, err.to_string()).await;
            break;
        }

        // Retryable: persist the pause and wait for an operator decision
        let gate = handler.arm_retry_gate();
        deal.err = Some(err.to_string());
        deal.retry = policy;
        ctx.deps.logger.log(
            deal_uuid,
            DealLogEvent::Paused {
                error: err.to_string(),
                retry: policy,
            },
        );
        if let Err(e) = ctx.deps.store.update(&deal).await {
            error!(%deal_uuid, error = %e, "failed to persist paused deal");
        }
        handler.publish(&deal);

        match handler.await_retry_decision(gate, &ctx.shutdown).await {
            Some(RetryAction::Resume) => {
                info!(%deal_uuid, checkpoint = %deal.checkpoint, "resuming paused deal");
                deal.err = None;
                deal.retry = RetryPolicy::Auto;
                if let Err(e) = ctx.deps.store.update(&deal).await {
                    error!(%deal_uuid, error = %e, "failed to persist resumed deal");
                }
                ctx.deps.logger.log(
                    deal_uuid,
                    DealLogEvent::Resumed {
                        checkpoint: deal.checkpoint,
                    },
                );
            }
            Some(RetryAction::Fail) => {
                fail_deal(&ctx, &handler, &mut deal, "user manually terminated the deal").await;
                break;
            }
            Some(RetryAction::Park) | None => break,
        }
    }

    debug!(%deal_uuid, checkpoint = %deal.checkpoint, "pipeline exited");
    drop(guard);
}

async fn fail_deal(
    ctx: &ExecutionContext,
    handler: &DealHandler,
    deal: &mut ProviderDeal,
    err: impl Into<String>,
) {
    let err = err.into();
    if let Err(e) = deal.fail(err.clone()) {
        error!(deal_uuid = %deal.deal_uuid, error = %e, "failed to mark deal as failed");
        return;
    }
    ctx.deps
        .logger
        .log(deal.deal_uuid, DealLogEvent::Failed { error: err });
    if let Err(e) = ctx.deps.store.update(deal).await {
        error!(deal_uuid = %deal.deal_uuid, error = %e, "failed to persist failed deal");
    }
    handler.publish(deal);

    match ctx.run_loop.finished(deal.clone()).await {
        Ok(updated) => *deal = updated,
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(deal_uuid = %deal.deal_uuid, error = %e, "failed to finish deal"),
    }
}

/// Move the deal to `to`, persist and broadcast it.
async fn advance_and_persist(
    ctx: &ExecutionContext,
    handler: &DealHandler,
    deal: &mut ProviderDeal,
    to: Checkpoint,
) -> Result<()> {
    deal.advance(to)?;
    ctx.deps.store.update(deal).await?;
    ctx.deps
        .logger
        .log(deal.deal_uuid, DealLogEvent::CheckpointReached { checkpoint: to });
    handler.publish(deal);
    Ok(())
}

async fn execute(
    ctx: &ExecutionContext,
    handler: &DealHandler,
    deal: &mut ProviderDeal,
) -> Result<Outcome> {
    if deal.checkpoint < Checkpoint::Transferred {
        if deal.is_offline {
            verify_import(deal).await?;
        } else {
            transfer(ctx, handler, deal).await?;
        }
        advance_and_persist(ctx, handler, deal, Checkpoint::Transferred).await?;
    }

    if deal.checkpoint < Checkpoint::Published {
        let publish_cid = ctx
            .shutdown
            .run_until_cancelled(ctx.deps.publisher.publish(deal))
            .await??;
        deal.publish_cid = Some(publish_cid);
        deal.advance(Checkpoint::Published)?;
        // The run loop records the publish reference and persists the deal
        ctx.run_loop.published(deal.clone()).await?;
        ctx.deps.logger.log(
            deal.deal_uuid,
            DealLogEvent::CheckpointReached {
                checkpoint: Checkpoint::Published,
            },
        );
        handler.publish(deal);
    }

    if deal.checkpoint < Checkpoint::PublishConfirmed {
        let publish_cid = deal
            .publish_cid
            .clone()
            .ok_or_else(|| ProvdError::Publish("deal has no publish reference".into()))?;
        let chain_deal_id = ctx
            .shutdown
            .run_until_cancelled(ctx.deps.publisher.wait_for_publish(&publish_cid))
            .await??;
        deal.chain_deal_id = Some(chain_deal_id);
        advance_and_persist(ctx, handler, deal, Checkpoint::PublishConfirmed).await?;
    }

    if deal.checkpoint < Checkpoint::Committed {
        let retry = CommitRetry {
            wait: ctx.config.commit_retry_wait,
            timeout: ctx.config.commit_retry_timeout,
        };
        let placement = commit_with_retry(
            ctx.deps.committer.as_ref(),
            ctx.deps.logger.as_ref(),
            retry,
            deal,
            &ctx.shutdown,
        )
        .await?;
        deal.placement = Some(placement);
        advance_and_persist(ctx, handler, deal, Checkpoint::Committed).await?;
    }

    if deal.checkpoint < Checkpoint::CommittedAndAnnounced {
        ctx.shutdown
            .run_until_cancelled(ctx.deps.announcer.announce(deal))
            .await??;
        advance_and_persist(ctx, handler, deal, Checkpoint::CommittedAndAnnounced).await?;
        // Resources are released as soon as the deal is committed and announced
        *deal = ctx.run_loop.finished(deal.clone()).await?;
    }

    if deal.checkpoint < Checkpoint::Complete {
        if !wait_for_final_slot(ctx, deal).await? {
            return Ok(Outcome::Cancelled);
        }
        advance_and_persist(ctx, handler, deal, Checkpoint::Complete).await?;
        *deal = ctx.run_loop.finished(deal.clone()).await?;
    }

    Ok(Outcome::Finished)
}

async fn verify_import(deal: &ProviderDeal) -> Result<()> {
    let path = deal
        .inbound_file_path
        .as_ref()
        .ok_or_else(|| ProvdError::Validation("offline deal data has not been imported".into()))?;
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        ProvdError::Validation(format!("cannot read imported file {}: {}", path.display(), e))
    })?;
    if meta.len() < deal.transfer.size {
        return Err(ProvdError::Validation(format!(
            "imported file has {} bytes, expected {}",
            meta.len(),
            deal.transfer.size
        )));
    }
    Ok(())
}

async fn transfer(ctx: &ExecutionContext, handler: &DealHandler, deal: &ProviderDeal) -> Result<()> {
    let deal_uuid = deal.deal_uuid;
    let dest = deal
        .inbound_file_path
        .clone()
        .ok_or_else(|| ProvdError::Transfer("deal has no staging path".into()))?;

    let progress = ctx.transfers.register(deal_uuid);
    let result: Result<()> = async {
        let _permit = ctx
            .limiter
            .acquire(deal_uuid, Arc::clone(&progress), &ctx.shutdown)
            .await?;

        let cancel = handler.begin_transfer();
        ctx.deps.logger.log(deal_uuid, DealLogEvent::TransferStarted);

        let max = ctx.config.max_transfer_duration;
        let transfer = tokio::time::timeout(
            max,
            ctx.deps.transport.transfer(deal, &dest, Arc::clone(&progress)),
        );

        let outcome = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => Err(ProvdError::Cancelled),
            Ok(()) = cancel => {
                ctx.deps.logger.log(deal_uuid, DealLogEvent::TransferCancelled);
                Err(ProvdError::TransferCancelled)
            }
            res = transfer => match res {
                Ok(res) => res,
                Err(_) => Err(ProvdError::TransferTimeout(max)),
            },
        };
        handler.end_transfer();

        let received = outcome?;
        if received < deal.transfer.size {
            return Err(ProvdError::Transfer(format!(
                "received {} bytes, expected {}",
                received, deal.transfer.size
            )));
        }
        info!(%deal_uuid, bytes = received, "data transfer complete");
        Ok(())
    }
    .await;

    ctx.transfers.complete(deal_uuid);
    if let Err(e) = &result {
        if !e.is_cancelled() {
            warn!(%deal_uuid, error = %e, "data transfer failed");
        }
    }
    result
}

/// Poll the committed slot until it reaches a final state. `false` on shutdown.
async fn wait_for_final_slot(ctx: &ExecutionContext, deal: &ProviderDeal) -> Result<bool> {
    let slot = match deal.placement {
        Some(placement) => placement.slot,
        None => return Err(ProvdError::Commit("deal has no slot placement".into())),
    };

    let mut tick = tokio::time::interval(ctx.config.slot_poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(false),
            _ = tick.tick() => {}
        }
        match ctx.deps.committer.slot_status(slot).await {
            Ok(state) if state.is_final() => {
                ctx.deps
                    .logger
                    .log(deal.deal_uuid, DealLogEvent::SlotFinalized { slot });
                return Ok(true);
            }
            Ok(state) => debug!(deal_uuid = %deal.deal_uuid, slot, ?state, "slot not final yet"),
            Err(e) => warn!(deal_uuid = %deal.deal_uuid, slot, error = %e, "failed to check slot status"),
        }
    }
}
