//! Provider run loop
//!
//! The single serialization point for deal admission and completion. The
//! loop owns the reservation view and is the only place handlers are created
//! or removed. Requests arrive on five typed channels and are answered one at
//! a time, so the capacity check and the reservation that follows it can
//! never interleave with another deal's.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::{
    AcceptDealRequest, DealRejectionInfo, FinishedDealRequest, PublishedDealRequest,
    StorageSpaceRequest, UpdateRetryStateRequest,
};
use super::handler::{DealHandler, DealHandlerRegistry, RetryDelivery};
use super::state::ReservationView;
use super::traits::{FilterParams, StorageSpace};
use crate::coordination::ShutdownToken;
use crate::deal_log::DealLogEvent;
use crate::domain::{retry_action, Checkpoint, ProviderDeal, RetryAction, RetryPolicy, RetryTrigger};
use crate::error::{ProvdError, Result};
use crate::execution::{run_pipeline, ExecutionContext};

const REQUEST_BUFFER: usize = 64;

/// Clonable sender side of the run loop
#[derive(Debug, Clone)]
pub struct RunLoopHandle {
    accept_tx: mpsc::Sender<AcceptDealRequest>,
    finished_tx: mpsc::Sender<FinishedDealRequest>,
    published_tx: mpsc::Sender<PublishedDealRequest>,
    retry_tx: mpsc::Sender<UpdateRetryStateRequest>,
    storage_tx: mpsc::Sender<StorageSpaceRequest>,
    shutdown: ShutdownToken,
}

/// Receiver side, consumed by [`RunLoop`]
#[derive(Debug)]
pub struct RunLoopInbox {
    accept_rx: mpsc::Receiver<AcceptDealRequest>,
    finished_rx: mpsc::Receiver<FinishedDealRequest>,
    published_rx: mpsc::Receiver<PublishedDealRequest>,
    retry_rx: mpsc::Receiver<UpdateRetryStateRequest>,
    storage_rx: mpsc::Receiver<StorageSpaceRequest>,
}

pub fn channel(shutdown: ShutdownToken) -> (RunLoopHandle, RunLoopInbox) {
    let (accept_tx, accept_rx) = mpsc::channel(REQUEST_BUFFER);
    let (finished_tx, finished_rx) = mpsc::channel(REQUEST_BUFFER);
    let (published_tx, published_rx) = mpsc::channel(REQUEST_BUFFER);
    let (retry_tx, retry_rx) = mpsc::channel(REQUEST_BUFFER);
    let (storage_tx, storage_rx) = mpsc::channel(REQUEST_BUFFER);
    (
        RunLoopHandle {
            accept_tx,
            finished_tx,
            published_tx,
            retry_tx,
            storage_tx,
            shutdown,
        },
        RunLoopInbox {
            accept_rx,
            finished_rx,
            published_rx,
            retry_rx,
            storage_rx,
        },
    )
}

impl RunLoopHandle {
    /// Send a request and wait for its reply. Both waits give up with
    /// `Cancelled` on shutdown.
    async fn request<R, T>(
        &self,
        tx: &mpsc::Sender<R>,
        request: R,
        reply: oneshot::Receiver<Result<T>>,
        channel: &str,
    ) -> Result<T> {
        self.shutdown
            .run_until_cancelled(tx.send(request))
            .await?
            .map_err(|_| ProvdError::Internal(format!("run loop {channel} channel closed")))?;

        self.shutdown
            .run_until_cancelled(reply)
            .await?
            .map_err(|_| ProvdError::Cancelled)?
    }

    /// Submit a deal for admission and block until it is accepted or rejected
    pub async fn accept(&self, deal: ProviderDeal, is_import: bool) -> Result<DealRejectionInfo> {
        let (reply, rx) = oneshot::channel();
        let request = AcceptDealRequest {
            deal,
            is_import,
            reply,
        };
        self.request(&self.accept_tx, request, rx, "accept").await
    }

    /// Report a finishing checkpoint; returns the deal as persisted afterwards
    pub async fn finished(&self, deal: ProviderDeal) -> Result<ProviderDeal> {
        let (reply, rx) = oneshot::channel();
        let request = FinishedDealRequest { deal, reply };
        self.request(&self.finished_tx, request, rx, "finished").await
    }

    pub async fn published(&self, deal: ProviderDeal) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let request = PublishedDealRequest { deal, reply };
        self.request(&self.published_tx, request, rx, "published").await
    }

    pub async fn update_retry_state(&self, deal_uuid: Uuid, retry: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let request = UpdateRetryStateRequest {
            deal_uuid,
            retry,
            reply,
        };
        self.request(&self.retry_tx, request, rx, "retry").await
    }

    pub async fn storage_space(&self) -> Result<StorageSpace> {
        let (reply, rx) = oneshot::channel();
        let request = StorageSpaceRequest::Query { reply };
        self.request(&self.storage_tx, request, rx, "storage").await
    }

    pub async fn set_storage_capacity(&self, total: u64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let request = StorageSpaceRequest::SetCapacity { total, reply };
        self.request(&self.storage_tx, request, rx, "storage").await
    }
}

pub struct RunLoop {
    pub(super) ctx: Arc<ExecutionContext>,
    pub(super) registry: DealHandlerRegistry,
    pub(super) reservations: ReservationView,
    pub(super) pipelines: JoinSet<()>,
    new_deals: broadcast::Sender<ProviderDeal>,
    inbox: RunLoopInbox,
}

impl RunLoop {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        registry: DealHandlerRegistry,
        new_deals: broadcast::Sender<ProviderDeal>,
        inbox: RunLoopInbox,
    ) -> Self {
        Self {
            ctx,
            registry,
            reservations: ReservationView::new(),
            pipelines: JoinSet::new(),
            new_deals,
            inbox,
        }
    }

    /// Serve requests until shutdown, then wait for every pipeline to exit.
    pub async fn run(mut self) {
        info!(
            in_flight = self.reservations.len(),
            "provider run loop started"
        );
        let shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("provider run loop: shutdown signal received");
                    break;
                }

                Some(req) = self.inbox.accept_rx.recv() => {
                    let result = self.handle_accept(req.deal, req.is_import).await;
                    let _ = req.reply.send(result);
                }

                Some(req) = self.inbox.finished_rx.recv() => {
                    let result = self.handle_finished(req.deal).await;
                    let _ = req.reply.send(result);
                }

                Some(req) = self.inbox.published_rx.recv() => {
                    let result = self.handle_published(req.deal).await;
                    let _ = req.reply.send(result);
                }

                Some(req) = self.inbox.retry_rx.recv() => {
                    let result = self.handle_retry_state(req.deal_uuid, req.retry).await;
                    let _ = req.reply.send(result);
                }

                Some(req) = self.inbox.storage_rx.recv() => {
                    self.handle_storage(req).await;
                }

                Some(joined) = self.pipelines.join_next(), if !self.pipelines.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "deal pipeline task failed");
                    }
                }
            }
        }

        debug!(pipelines = self.pipelines.len(), "waiting for deal pipelines");
        while let Some(joined) = self.pipelines.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "deal pipeline task failed");
            }
        }
        info!("provider run loop stopped");
    }

    pub(super) fn spawn_pipeline(&mut self, handler: &Arc<DealHandler>, deal: ProviderDeal) {
        match handler.try_begin_pipeline() {
            Some(guard) => {
                self.pipelines
                    .spawn(run_pipeline(Arc::clone(&self.ctx), guard, deal));
            }
            None => debug!(deal_uuid = %deal.deal_uuid, "pipeline already running"),
        }
    }

    async fn handle_accept(
        &mut self,
        deal: ProviderDeal,
        is_import: bool,
    ) -> Result<DealRejectionInfo> {
        if is_import {
            return self.accept_import(deal).await;
        }
        self.accept_proposal(deal).await
    }

    async fn accept_proposal(&mut self, mut deal: ProviderDeal) -> Result<DealRejectionInfo> {
        let deal_uuid = deal.deal_uuid;
        let deps = &self.ctx.deps;

        match deps.store.by_id(deal_uuid).await {
            Ok(_) => return Err(ProvdError::DealAlreadyExists(deal_uuid)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let params = FilterParams {
            deal: deal.clone(),
            storage: deps.capacity.space().await?,
            available_funds: deps.funds.available().await?,
        };
        let decision = deps
            .filter
            .evaluate(&params)
            .await
            .map_err(|e| ProvdError::Filter(e.to_string()))?;
        if !decision.accept {
            return Ok(DealRejectionInfo::rejected(format!(
                "deal filter rejected deal: {}",
                decision.reason
            )));
        }

        let collateral = deal.proposal().provider_collateral;
        let publish_fee = self.ctx.config.publish_fee;
        match deps.funds.tag(deal_uuid, collateral, publish_fee).await {
            Ok(()) => {}
            Err(e) if e.is_resource_exhaustion() => {
                return Ok(DealRejectionInfo::rejected(format!(
                    "cannot accept deal: {e}"
                )))
            }
            Err(e) => return Err(e),
        }
        self.reservations
            .record_funds(deal_uuid, collateral, publish_fee);

        if !deal.is_offline {
            let size = deal.storage_size();
            if let Err(e) = self.ctx.deps.capacity.tag(deal_uuid, size).await {
                self.release(deal_uuid).await;
                if e.is_resource_exhaustion() {
                    return Ok(DealRejectionInfo::rejected(format!(
                        "cannot accept deal: {e}"
                    )));
                }
                return Err(e);
            }
            self.reservations.record_storage(deal_uuid, size);
            deal.inbound_file_path = Some(
                self.ctx
                    .config
                    .staging_dir
                    .join(format!("{deal_uuid}.car")),
            );
        }

        let handler = match self.registry.create(deal_uuid).await {
            Ok(handler) => handler,
            Err(e) => {
                self.release(deal_uuid).await;
                return Err(e);
            }
        };
        if let Err(e) = self.ctx.deps.store.create(&deal).await {
            self.registry.remove(deal_uuid).await;
            self.release(deal_uuid).await;
            return Err(e);
        }

        info!(
            %deal_uuid,
            offline = deal.is_offline,
            size = deal.storage_size(),
            "deal accepted"
        );
        let _ = self.new_deals.send(deal.clone());

        if !deal.is_offline {
            self.spawn_pipeline(&handler, deal);
        }
        Ok(DealRejectionInfo::accepted())
    }

    async fn accept_import(&mut self, deal: ProviderDeal) -> Result<DealRejectionInfo> {
        let deal_uuid = deal.deal_uuid;
        let stored = self.ctx.deps.store.by_id(deal_uuid).await?;
        if !stored.is_offline {
            return Err(ProvdError::Validation(format!(
                "deal {deal_uuid} is not an offline deal"
            )));
        }
        if stored.checkpoint > Checkpoint::Accepted || stored.inbound_file_path.is_some() {
            return Err(ProvdError::Validation(format!(
                "deal {deal_uuid} data has already been imported"
            )));
        }

        let size = deal.storage_size();
        match self.ctx.deps.capacity.tag(deal_uuid, size).await {
            Ok(()) => {}
            Err(e) if e.is_resource_exhaustion() => {
                return Ok(DealRejectionInfo::rejected(format!(
                    "cannot accept deal: {e}"
                )))
            }
            Err(e) => return Err(e),
        }
        self.reservations.record_storage(deal_uuid, size);

        if let Err(e) = self.ctx.deps.store.update(&deal).await {
            if let Err(untag) = self.ctx.deps.capacity.untag(deal_uuid).await {
                warn!(%deal_uuid, error = %untag, "failed to untag storage after import error");
            }
            self.reservations.clear_storage(deal_uuid);
            return Err(e);
        }

        let handler = self.registry.get_or_create(deal_uuid).await;
        info!(%deal_uuid, "offline deal data imported");
        self.spawn_pipeline(&handler, deal);
        Ok(DealRejectionInfo::accepted())
    }

    /// Release the deal's reservations. A second call for the same deal does nothing.
    pub(super) async fn release(&mut self, deal_uuid: Uuid) -> bool {
        let Some(held) = self.reservations.take(deal_uuid) else {
            debug!(%deal_uuid, "no reservations held");
            return false;
        };

        let deps = &self.ctx.deps;
        if held.storage.is_some() {
            match deps.capacity.untag(deal_uuid).await {
                Ok(()) => deps.logger.log(deal_uuid, DealLogEvent::StorageUntagged),
                Err(e) => deps.logger.log(
                    deal_uuid,
                    DealLogEvent::UntagFailed {
                        error: e.to_string(),
                    },
                ),
            }
        }
        if held.funds.is_some() {
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
        }
        true
    }

    async fn handle_finished(&mut self, mut deal: ProviderDeal) -> Result<ProviderDeal> {
        let deal_uuid = deal.deal_uuid;
        self.release(deal_uuid).await;

        if !deal.cleanup_done {
            remove_inbound_file(&deal).await;
            deal.cleanup_done = true;
            self.ctx.deps.store.update(&deal).await?;
        }

        if deal.is_terminal() {
            self.registry.remove(deal_uuid).await;
        }
        info!(%deal_uuid, checkpoint = %deal.checkpoint, "deal finished");
        Ok(deal)
    }

    async fn handle_published(&mut self, deal: ProviderDeal) -> Result<()> {
        self.ctx.deps.store.update(&deal).await?;
        info!(
            deal_uuid = %deal.deal_uuid,
            publish_cid = deal.publish_cid.as_deref().unwrap_or_default(),
            "deal published"
        );
        Ok(())
    }

    async fn handle_retry_state(&mut self, deal_uuid: Uuid, retry: bool) -> Result<()> {
        let handler = self
            .registry
            .get(deal_uuid)
            .await
            .ok_or(ProvdError::HandlerNotFound(deal_uuid))?;
        let deal = self.ctx.deps.store.by_id(deal_uuid).await?;
        if deal.is_terminal() || deal.awaiting_import() {
            return Err(ProvdError::NotPaused(deal_uuid));
        }

        let action = retry_action(deal.retry, RetryTrigger::Operator { retry });
        match handler.deliver_retry_decision(action)? {
            RetryDelivery::Delivered => {
                debug!(%deal_uuid, ?action, "retry decision delivered to pipeline");
                Ok(())
            }
            RetryDelivery::Idle => match action {
                RetryAction::Resume => {
                    let mut deal = deal;
                    deal.err = None;
                    deal.retry = RetryPolicy::Auto;
                    self.ctx.deps.store.update(&deal).await?;
                    self.ctx.deps.logger.log(
                        deal_uuid,
                        DealLogEvent::Resumed {
                            checkpoint: deal.checkpoint,
                        },
                    );
                    self.spawn_pipeline(&handler, deal);
                    Ok(())
                }
                RetryAction::Fail | RetryAction::Park => {
                    self.fail_idle_deal(&handler, deal, "user manually terminated the deal")
                        .await
                }
            },
        }
    }

    /// Terminate a deal that has no running pipeline
    pub(super) async fn fail_idle_deal(
        &mut self,
        handler: &DealHandler,
        mut deal: ProviderDeal,
        err: &str,
    ) -> Result<()> {
        deal.fail(err)?;
        self.ctx.deps.store.update(&deal).await?;
        self.ctx.deps.logger.log(
            deal.deal_uuid,
            DealLogEvent::Failed {
                error: err.to_string(),
            },
        );
        handler.publish(&deal);
        self.handle_finished(deal).await.map(|_| ())
    }

    async fn handle_storage(&mut self, req: StorageSpaceRequest) {
        let capacity = &self.ctx.deps.capacity;
        match req {
            StorageSpaceRequest::Query { reply } => {
                let _ = reply.send(capacity.space().await);
            }
            StorageSpaceRequest::SetCapacity { total, reply } => {
                let result = capacity.set_total(total).await;
                if result.is_ok() {
                    info!(total, "storage capacity changed");
                }
                let _ = reply.send(result);
            }
        }
    }
}

/// Remove the staged payload of an online deal. Offline payloads belong to
/// the operator and are left alone.
pub(super) async fn remove_inbound_file(deal: &ProviderDeal) {
    if deal.is_offline {
        return;
    }
    let Some(path) = &deal.inbound_file_path else {
        return;
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(deal_uuid = %deal.deal_uuid, path = %path.display(), "removed inbound file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            deal_uuid = %deal.deal_uuid,
            path = %path.display(),
            error = %e,
            "failed to remove inbound file"
        ),
    }
}
