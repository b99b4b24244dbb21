//! In-memory collaborators and a provider harness for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use provd::adapters::{
    LogAnnouncer, MemoryCapacityManager, MemoryDealStore, MemoryFundsManager,
};
use provd::deal_log::{DealLogEvent, MemoryDealLogger};
use provd::domain::{
    Checkpoint, DealParams, DealProposal, ProviderDeal, SignedProposal, SlotNumber, TransferParams,
};
use provd::error::{ProvdError, Result};
use provd::filter::AcceptAllFilter;
use provd::provider::{
    CommitInfo, DealPublisher, DealStore, PayloadReader, PieceCommitter, Provider,
    ProviderConfig, ProviderDeps, SlotState, TransferProgress, Transport,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use uuid::Uuid;

pub const PROVIDER_ADDRESS: &str = "f01000";

pub fn params(piece_size: u64) -> DealParams {
    DealParams {
        deal_uuid: Uuid::new_v4(),
        is_offline: false,
        client_deal_proposal: SignedProposal {
            proposal: DealProposal {
                piece_cid: format!("baga6ea4sea{}", Uuid::new_v4().simple()),
                piece_size,
                client: "f1client".into(),
                provider: PROVIDER_ADDRESS.into(),
                label: String::new(),
                start_epoch: 100,
                end_epoch: 100 + 600_000,
                storage_price_per_epoch: Decimal::ZERO,
                provider_collateral: Decimal::ONE,
                client_collateral: Decimal::ZERO,
                verified_deal: false,
            },
            client_signature: "sig".into(),
        },
        deal_data_root: "bafyroot".into(),
        transfer: TransferParams {
            kind: "http".into(),
            url: Some("http://client.example/data.car".into()),
            size: piece_size / 2,
        },
    }
}

pub fn offline_params(piece_size: u64) -> DealParams {
    let mut params = params(piece_size);
    params.is_offline = true;
    params.transfer.url = None;
    params
}

/// Transport that writes `transfer.size` bytes once its gate is open
pub struct GatedTransport {
    open: watch::Sender<bool>,
    started: AtomicUsize,
}

impl GatedTransport {
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self {
            open: tx,
            started: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn transfer(
        &self,
        deal: &ProviderDeal,
        dest: &Path,
        progress: TransferProgress,
    ) -> Result<u64> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.open.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map_err(|_| ProvdError::Transfer("transport gate dropped".into()))?;

        let bytes = vec![7u8; deal.transfer.size as usize];
        let mut file = tokio::fs::File::create(dest).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        progress.store(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes.len() as u64)
    }
}

/// Publisher counting successful publish calls per deal
#[derive(Default)]
pub struct CountingPublisher {
    publishes: Mutex<HashMap<Uuid, usize>>,
    next_deal_id: AtomicU64,
    failing: AtomicBool,
}

impl CountingPublisher {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn publishes(&self, deal_uuid: Uuid) -> usize {
        self.publishes
            .lock()
            .unwrap()
            .get(&deal_uuid)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DealPublisher for CountingPublisher {
    async fn publish(&self, deal: &ProviderDeal) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProvdError::Publish("chain node unreachable".into()));
        }
        *self
            .publishes
            .lock()
            .unwrap()
            .entry(deal.deal_uuid)
            .or_default() += 1;
        Ok(format!("publish-{}", deal.deal_uuid))
    }

    async fn wait_for_publish(&self, _publish_cid: &str) -> Result<u64> {
        Ok(self.next_deal_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Committer that reports saturation while `saturated` is set and seals
/// every slot immediately otherwise
#[derive(Default)]
pub struct ScriptedCommitter {
    saturated: AtomicBool,
    attempts: AtomicUsize,
    next_slot: AtomicU64,
}

impl ScriptedCommitter {
    pub fn set_saturated(&self, saturated: bool) {
        self.saturated.store(saturated, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PieceCommitter for ScriptedCommitter {
    async fn commit(
        &self,
        _size: u64,
        mut payload: PayloadReader,
        _info: &CommitInfo,
    ) -> Result<(SlotNumber, u64)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.saturated.load(Ordering::SeqCst) {
            return Err(ProvdError::SlotsSaturated);
        }
        let mut buf = Vec::new();
        payload.read_to_end(&mut buf).await?;
        Ok((self.next_slot.fetch_add(1, Ordering::SeqCst) + 1, 0))
    }

    async fn slot_status(&self, _slot: SlotNumber) -> Result<SlotState> {
        Ok(SlotState::Sealed)
    }
}

/// Deal store that can be told to refuse new deals
pub struct FaultyStore {
    inner: Arc<MemoryDealStore>,
    fail_create: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryDealStore>) -> Self {
        Self {
            inner,
            fail_create: AtomicBool::new(false),
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DealStore for FaultyStore {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn create(&self, deal: &ProviderDeal) -> Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProvdError::Internal("deal store unavailable".into()));
        }
        self.inner.create(deal).await
    }

    async fn update(&self, deal: &ProviderDeal) -> Result<()> {
        self.inner.update(deal).await
    }

    async fn by_id(&self, deal_uuid: Uuid) -> Result<ProviderDeal> {
        self.inner.by_id(deal_uuid).await
    }

    async fn by_signed_proposal(&self, proposal_id: &str) -> Result<ProviderDeal> {
        self.inner.by_signed_proposal(proposal_id).await
    }

    async fn list_active(&self) -> Result<Vec<ProviderDeal>> {
        self.inner.list_active().await
    }

    async fn list_completed(&self) -> Result<Vec<ProviderDeal>> {
        self.inner.list_completed().await
    }
}

pub struct Harness {
    pub provider: Arc<Provider>,
    pub store: Arc<MemoryDealStore>,
    pub faults: Arc<FaultyStore>,
    pub capacity: Arc<MemoryCapacityManager>,
    pub funds: Arc<MemoryFundsManager>,
    pub logger: Arc<MemoryDealLogger>,
    pub transport: Arc<GatedTransport>,
    pub publisher: Arc<CountingPublisher>,
    pub committer: Arc<ScriptedCommitter>,
    pub staging: Arc<tempfile::TempDir>,
}

pub struct HarnessBuilder {
    storage: u64,
    funds: Decimal,
    transport_open: bool,
    max_transfer_duration: Option<Duration>,
    store: Option<Arc<MemoryDealStore>>,
    staging: Option<Arc<tempfile::TempDir>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            storage: 1 << 20,
            funds: Decimal::from(100),
            transport_open: true,
            max_transfer_duration: None,
            store: None,
            staging: None,
        }
    }

    /// A fresh process over `previous`'s deal store and staging area. Pools,
    /// collaborators and the run loop all start from scratch.
    pub fn restart_of(mut self, previous: &Harness) -> Self {
        self.store = Some(Arc::clone(&previous.store));
        self.staging = Some(Arc::clone(&previous.staging));
        self
    }

    pub fn max_transfer_duration(mut self, max: Duration) -> Self {
        self.max_transfer_duration = Some(max);
        self
    }

    pub fn storage(mut self, bytes: u64) -> Self {
        self.storage = bytes;
        self
    }

    pub fn funds(mut self, balance: Decimal) -> Self {
        self.funds = balance;
        self
    }

    /// Hold every transfer until `GatedTransport::open`
    pub fn gated_transport(mut self) -> Self {
        self.transport_open = false;
        self
    }

    pub fn build(self) -> Harness {
        let staging = self
            .staging
            .unwrap_or_else(|| Arc::new(tempfile::tempdir().unwrap()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryDealStore::new()));
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let capacity = Arc::new(MemoryCapacityManager::new(self.storage));
        let funds = Arc::new(MemoryFundsManager::new(self.funds));
        let logger = Arc::new(MemoryDealLogger::new());
        let transport = Arc::new(GatedTransport::new(self.transport_open));
        let publisher = Arc::new(CountingPublisher::default());
        let committer = Arc::new(ScriptedCommitter::default());

        let mut config = ProviderConfig {
            address: PROVIDER_ADDRESS.to_string(),
            staging_dir: staging.path().to_path_buf(),
            commit_retry_wait: Duration::from_millis(10),
            commit_retry_timeout: Duration::from_millis(50),
            slot_poll_interval: Duration::from_millis(10),
            ..ProviderConfig::default()
        };
        if let Some(max) = self.max_transfer_duration {
            config.max_transfer_duration = max;
        }
        let deps = ProviderDeps {
            store: faults.clone(),
            capacity: capacity.clone(),
            funds: funds.clone(),
            filter: Arc::new(AcceptAllFilter),
            committer: committer.clone(),
            transport: transport.clone(),
            publisher: publisher.clone(),
            announcer: Arc::new(LogAnnouncer),
            logger: logger.clone(),
        };

        Harness {
            provider: Arc::new(Provider::new(config, deps)),
            store,
            faults,
            capacity,
            funds,
            logger,
            transport,
            publisher,
            committer,
            staging,
        }
    }
}

impl Harness {
    pub async fn started() -> Self {
        let harness = HarnessBuilder::new().build();
        harness.provider.start().await.unwrap();
        harness
    }

    /// Poll the store until the deal satisfies `pred`
    pub async fn wait_for_deal(
        &self,
        deal_uuid: Uuid,
        pred: impl Fn(&ProviderDeal) -> bool,
    ) -> ProviderDeal {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(deal) = self.store.by_id(deal_uuid).await {
                if pred(&deal) {
                    return deal;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for deal {deal_uuid}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the deal is `Complete` and the run loop has removed its
    /// handler, which happens after reservations are released
    pub async fn wait_for_finished(&self, deal_uuid: Uuid) -> ProviderDeal {
        let deal = self
            .wait_for_deal(deal_uuid, |d| d.checkpoint == Checkpoint::Complete)
            .await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.provider.subscribe_deal_updates(deal_uuid).await.is_ok() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for handler of {deal_uuid} to be removed"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.store.by_id(deal_uuid).await.unwrap_or(deal)
    }

    /// Poll the logger until an event matching `pred` was recorded
    pub async fn wait_for_event(&self, deal_uuid: Uuid, pred: impl Fn(&DealLogEvent) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.logger.contains(deal_uuid, &pred) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for event on deal {deal_uuid}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn count_events(&self, deal_uuid: Uuid, pred: impl Fn(&DealLogEvent) -> bool) -> usize {
        self.logger
            .events_for(deal_uuid)
            .iter()
            .filter(|e| pred(e))
            .count()
    }
}
