//! Provider facade
//!
//! Public entry point wiring the run loop, the handler registry, the
//! transfer limiter and sampler to a set of collaborators. Ingress
//! (network proposals, offline imports, operator actions) goes through here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::command::DealRejectionInfo;
use super::config::ProviderConfig;
use super::handler::DealHandlerRegistry;
use super::run_loop::{self, RunLoop, RunLoopHandle};
use super::traits::{
    Announcer, CapacityManager, DealFilter, DealPublisher, DealStore, FundsManager,
    PieceCommitter, StorageSpace, Transport,
};
use crate::coordination::ShutdownController;
use crate::deal_log::{DealLogEvent, DealLogger};
use crate::domain::{Checkpoint, DealParams, ProviderDeal};
use crate::error::{ProvdError, Result};
use crate::execution::ExecutionContext;
use crate::transfer::{DealTransfers, TransferLimiter};
use crate::validation::validate_deal;

/// Collaborators the provider drives
#[derive(Clone)]
pub struct ProviderDeps {
    pub store: Arc<dyn DealStore>,
    pub capacity: Arc<dyn CapacityManager>,
    pub funds: Arc<dyn FundsManager>,
    pub filter: Arc<dyn DealFilter>,
    pub committer: Arc<dyn PieceCommitter>,
    pub transport: Arc<dyn Transport>,
    pub publisher: Arc<dyn DealPublisher>,
    pub announcer: Arc<dyn Announcer>,
    pub logger: Arc<dyn DealLogger>,
}

pub struct Provider {
    config: ProviderConfig,
    deps: ProviderDeps,
    registry: DealHandlerRegistry,
    new_deals: broadcast::Sender<ProviderDeal>,
    shutdown: ShutdownController,
    run_loop: RunLoopHandle,
    limiter: Arc<TransferLimiter>,
    transfers: Arc<DealTransfers>,
    pending: Mutex<Option<RunLoop>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Provider {
    pub fn new(config: ProviderConfig, deps: ProviderDeps) -> Self {
        let shutdown = ShutdownController::new();
        let token = shutdown.token();
        let registry = DealHandlerRegistry::new(config.broadcast_capacity);
        let (new_deals, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (handle, inbox) = run_loop::channel(token.clone());
        let limiter = Arc::new(TransferLimiter::new(config.transfer_limiter.clone()));
        let transfers = Arc::new(DealTransfers::new(config.transfer_sample_period));

        let ctx = Arc::new(ExecutionContext {
            config: config.clone(),
            deps: deps.clone(),
            limiter: Arc::clone(&limiter),
            transfers: Arc::clone(&transfers),
            run_loop: handle.clone(),
            shutdown: token,
        });
        let pending = RunLoop::new(ctx, registry.clone(), new_deals.clone(), inbox);

        Self {
            config,
            deps,
            registry,
            new_deals,
            shutdown,
            run_loop: handle,
            limiter,
            transfers,
            pending: Mutex::new(Some(pending)),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Recover persisted deals, then start the run loop and the background
    /// transfer tasks. Fails if the deal lists cannot be read.
    pub async fn start(&self) -> Result<()> {
        let mut run_loop = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| ProvdError::Internal("provider already started".into()))?;

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        run_loop.recover().await?;

        let token = self.shutdown.token();
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(run_loop.run()));
        tasks.push(tokio::spawn(
            Arc::clone(&self.transfers).start(token.clone()),
        ));
        tasks.push(tokio::spawn(Arc::clone(&self.limiter).run(token)));

        info!(address = %self.config.address, "provider started");
        Ok(())
    }

    /// Cancel everything and wait for the run loop and background tasks to
    /// exit. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.deps.store.list_active().await {
            Ok(deals) => {
                for deal in deals.iter().filter(|d| d.checkpoint < Checkpoint::Committed) {
                    info!(
                        deal_uuid = %deal.deal_uuid,
                        checkpoint = %deal.checkpoint,
                        "stopping provider with deal in progress"
                    );
                }
            }
            Err(e) => warn!(error = %e, "failed to list active deals on shutdown"),
        }

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "provider task failed during shutdown");
            }
        }
        info!("provider stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Validate and admit a proposal received from the network
    pub async fn execute_deal(
        &self,
        params: DealParams,
        client_peer_id: &str,
    ) -> Result<DealRejectionInfo> {
        let deal_uuid = params.deal_uuid;
        let logger = &self.deps.logger;
        logger.log(
            deal_uuid,
            DealLogEvent::ProposalReceived {
                peer: client_peer_id.to_string(),
            },
        );

        let deal = ProviderDeal::from_params(params, client_peer_id)?;
        match validate_deal(&self.config, &deal) {
            Ok(()) => {}
            Err(ProvdError::Validation(reason)) => {
                logger.log(
                    deal_uuid,
                    DealLogEvent::ValidationFailed {
                        reason: reason.clone(),
                    },
                );
                return Ok(DealRejectionInfo::rejected(format!(
                    "failed validation: {reason}"
                )));
            }
            Err(e) => return Err(e),
        }

        let offline = deal.is_offline;
        let result = self.run_loop.accept(deal, false).await;
        self.log_admission(deal_uuid, offline, &result);
        result
    }

    /// Supply the payload of an offline deal and start executing it
    pub async fn import_offline_deal_data(
        &self,
        deal_uuid: Uuid,
        path: PathBuf,
    ) -> Result<DealRejectionInfo> {
        let logger = &self.deps.logger;
        logger.log(
            deal_uuid,
            DealLogEvent::ImportRequested { path: path.clone() },
        );

        let mut deal = self.deps.store.by_id(deal_uuid).await?;
        if !deal.is_offline {
            return Err(ProvdError::Validation(format!(
                "deal {deal_uuid} is not an offline deal"
            )));
        }
        if deal.checkpoint > Checkpoint::Accepted {
            return Err(ProvdError::Validation(format!(
                "deal {deal_uuid} has already been imported (checkpoint {})",
                deal.checkpoint
            )));
        }

        deal.inbound_file_path = Some(path);
        let result = self.run_loop.accept(deal, true).await;
        match &result {
            Ok(info) if info.accepted => logger.log(deal_uuid, DealLogEvent::Imported),
            _ => self.log_admission(deal_uuid, true, &result),
        }
        result
    }

    fn log_admission(&self, deal_uuid: Uuid, offline: bool, result: &Result<DealRejectionInfo>) {
        let event = match result {
            Ok(info) if info.accepted => DealLogEvent::Accepted { offline },
            Ok(info) => DealLogEvent::Rejected {
                reason: info.reason.clone(),
            },
            Err(e) => DealLogEvent::AcceptanceFailed {
                error: e.to_string(),
            },
        };
        self.deps.logger.log(deal_uuid, event);
    }

    pub async fn deal(&self, deal_uuid: Uuid) -> Result<ProviderDeal> {
        self.deps.store.by_id(deal_uuid).await
    }

    pub async fn deal_by_proposal(&self, proposal_id: &str) -> Result<ProviderDeal> {
        self.deps.store.by_signed_proposal(proposal_id).await
    }

    /// Every deal accepted after this call
    pub fn subscribe_new_deals(&self) -> broadcast::Receiver<ProviderDeal> {
        self.new_deals.subscribe()
    }

    /// Status updates of one in-flight deal
    pub async fn subscribe_deal_updates(
        &self,
        deal_uuid: Uuid,
    ) -> Result<broadcast::Receiver<ProviderDeal>> {
        self.registry
            .get(deal_uuid)
            .await
            .map(|handler| handler.subscribe_updates())
            .ok_or(ProvdError::HandlerNotFound(deal_uuid))
    }

    pub async fn retry_paused_deal(&self, deal_uuid: Uuid) -> Result<()> {
        self.run_loop.update_retry_state(deal_uuid, true).await
    }

    pub async fn fail_paused_deal(&self, deal_uuid: Uuid) -> Result<()> {
        self.run_loop.update_retry_state(deal_uuid, false).await
    }

    /// Abort the running data transfer of an online deal
    pub async fn cancel_transfer(&self, deal_uuid: Uuid) -> Result<()> {
        let deal = self.deps.store.by_id(deal_uuid).await?;
        if deal.is_offline {
            return Err(ProvdError::Validation(
                "cannot cancel data transfer for an offline deal".to_string(),
            ));
        }

        let handler = self
            .registry
            .get(deal_uuid)
            .await
            .ok_or(ProvdError::HandlerNotFound(deal_uuid))?;
        let result = handler.cancel_transfer();
        if let Err(e) = &result {
            self.deps.logger.log(
                deal_uuid,
                DealLogEvent::TransferCancelFailed {
                    error: e.to_string(),
                },
            );
        }
        result
    }

    pub async fn storage_space(&self) -> Result<StorageSpace> {
        self.run_loop.storage_space().await
    }

    pub async fn set_storage_capacity(&self, total: u64) -> Result<()> {
        self.run_loop.set_storage_capacity(total).await
    }

    /// Bytes received so far for a deal's active transfer
    pub fn transferred(&self, deal_uuid: Uuid) -> Option<u64> {
        self.transfers.transferred(deal_uuid)
    }
}
