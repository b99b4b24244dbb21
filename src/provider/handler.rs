//! Per-deal handlers and their registry
//!
//! A [`DealHandler`] is the runtime face of one in-flight deal: it fans out
//! status updates to any number of subscribers and carries the control
//! signals an operator can send to the deal's execution pipeline (cancel the
//! data transfer, retry or fail a paused deal).
//!
//! Handlers are created and removed only by the run loop. Everyone else looks
//! them up through [`DealHandlerRegistry::get`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::coordination::ShutdownToken;
use crate::domain::{ProviderDeal, RetryAction};
use crate::error::{ProvdError, Result};

#[derive(Debug, Default)]
struct HandlerState {
    /// An execution pipeline is currently driving the deal
    running: bool,
    transfer_cancel: Option<oneshot::Sender<()>>,
    retry_gate: Option<oneshot::Sender<RetryAction>>,
}

/// Result of handing a retry decision to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelivery {
    /// A paused pipeline received the decision
    Delivered,
    /// No pipeline is running; the caller must act on the decision itself
    Idle,
}

#[derive(Debug)]
pub struct DealHandler {
    deal_uuid: Uuid,
    updates: broadcast::Sender<ProviderDeal>,
    state: Mutex<HandlerState>,
}

impl DealHandler {
    fn new(deal_uuid: Uuid, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            deal_uuid,
            updates,
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn deal_uuid(&self) -> Uuid {
        self.deal_uuid
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        // Critical sections never panic
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive every update published after this call
    pub fn subscribe_updates(&self) -> broadcast::Receiver<ProviderDeal> {
        self.updates.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    /// Fan out a new deal state. Having no subscribers is fine.
    pub fn publish(&self, deal: &ProviderDeal) {
        let _ = self.updates.send(deal.clone());
    }

    /// Register the active transfer; the returned receiver fires on cancel.
    pub fn begin_transfer(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state().transfer_cancel = Some(tx);
        rx
    }

    pub fn end_transfer(&self) {
        self.state().transfer_cancel = None;
    }

    pub fn has_active_transfer(&self) -> bool {
        self.state().transfer_cancel.is_some()
    }

    /// Signal the active transfer to abort
    pub fn cancel_transfer(&self) -> Result<()> {
        let cancel = self.state().transfer_cancel.take();
        match cancel {
            Some(tx) => tx
                .send(())
                .map_err(|_| ProvdError::NoActiveTransfer(self.deal_uuid)),
            None => Err(ProvdError::NoActiveTransfer(self.deal_uuid)),
        }
    }

    /// Claim the right to run the execution pipeline. Returns `None` when one
    /// is already running.
    pub fn try_begin_pipeline(self: &Arc<Self>) -> Option<PipelineGuard> {
        let mut state = self.state();
        if state.running {
            return None;
        }
        state.running = true;
        Some(PipelineGuard {
            handler: Arc::clone(self),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn is_awaiting_retry(&self) -> bool {
        self.state().retry_gate.is_some()
    }

    /// Open the retry gate. Decisions delivered from now on reach the
    /// returned [`RetryGate`].
    pub fn arm_retry_gate(&self) -> RetryGate {
        let (tx, rx) = oneshot::channel();
        self.state().retry_gate = Some(tx);
        RetryGate { rx }
    }

    /// Park until an operator decision arrives. `None` when the process is
    /// shutting down first.
    pub async fn await_retry_decision(
        &self,
        gate: RetryGate,
        shutdown: &ShutdownToken,
    ) -> Option<RetryAction> {
        let decision = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            decision = gate.rx => decision.ok(),
        };
        self.state().retry_gate = None;
        decision
    }

    /// Hand a retry decision to the paused pipeline, if there is one.
    pub fn deliver_retry_decision(&self, action: RetryAction) -> Result<RetryDelivery> {
        let mut state = self.state();
        if let Some(gate) = state.retry_gate.take() {
            return match gate.send(action) {
                Ok(()) => Ok(RetryDelivery::Delivered),
                Err(_) => Err(ProvdError::NotPaused(self.deal_uuid)),
            };
        }
        if state.running {
            return Err(ProvdError::NotPaused(self.deal_uuid));
        }
        Ok(RetryDelivery::Idle)
    }
}

/// Receiving end of a handler's retry gate
#[derive(Debug)]
pub struct RetryGate {
    rx: oneshot::Receiver<RetryAction>,
}

/// Marks the handler's pipeline as running until dropped
#[derive(Debug)]
pub struct PipelineGuard {
    handler: Arc<DealHandler>,
}

impl PipelineGuard {
    pub fn handler(&self) -> &Arc<DealHandler> {
        &self.handler
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        let mut state = self.handler.state();
        state.running = false;
        state.transfer_cancel = None;
        state.retry_gate = None;
    }
}

/// Handlers of all in-flight deals
#[derive(Debug, Clone)]
pub struct DealHandlerRegistry {
    handlers: Arc<RwLock<HashMap<Uuid, Arc<DealHandler>>>>,
    update_capacity: usize,
}

impl DealHandlerRegistry {
    pub fn new(update_capacity: usize) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            update_capacity,
        }
    }

    /// Fails with `HandlerAlreadyExists` when the deal already has one.
    pub async fn create(&self, deal_uuid: Uuid) -> Result<Arc<DealHandler>> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&deal_uuid) {
            return Err(ProvdError::HandlerAlreadyExists(deal_uuid));
        }
        let handler = Arc::new(DealHandler::new(deal_uuid, self.update_capacity));
        handlers.insert(deal_uuid, Arc::clone(&handler));
        debug!(%deal_uuid, "created deal handler");
        Ok(handler)
    }

    pub async fn get(&self, deal_uuid: Uuid) -> Option<Arc<DealHandler>> {
        self.handlers.read().await.get(&deal_uuid).cloned()
    }

    pub async fn get_or_create(&self, deal_uuid: Uuid) -> Arc<DealHandler> {
        let mut handlers = self.handlers.write().await;
        let capacity = self.update_capacity;
        Arc::clone(
            handlers
                .entry(deal_uuid)
                .or_insert_with(|| Arc::new(DealHandler::new(deal_uuid, capacity))),
        )
    }

    pub async fn remove(&self, deal_uuid: Uuid) -> Option<Arc<DealHandler>> {
        let removed = self.handlers.write().await.remove(&deal_uuid);
        if removed.is_some() {
            debug!(%deal_uuid, "removed deal handler");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ShutdownController;
    use crate::domain::fixtures;

    #[tokio::test]
    async fn test_registry_create_get_remove() {
        let registry = DealHandlerRegistry::new(8);
        let id = Uuid::new_v4();

        registry.create(id).await.unwrap();
        assert!(matches!(
            registry.create(id).await,
            Err(ProvdError::HandlerAlreadyExists(_))
        ));
        assert!(registry.get(id).await.is_some());

        registry.remove(id).await;
        assert!(registry.get(id).await.is_none());
        assert!(registry.remove(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let registry = DealHandlerRegistry::new(8);
        let deal = fixtures::deal(1024);
        let handler = registry.create(deal.deal_uuid).await.unwrap();

        let mut a = handler.subscribe_updates();
        let b = handler.subscribe_updates();
        drop(b);

        handler.publish(&deal);
        assert_eq!(a.recv().await.unwrap().deal_uuid, deal.deal_uuid);

        // A late subscriber only sees what comes after it
        let mut late = handler.subscribe_updates();
        assert!(late.try_recv().is_err());
        handler.publish(&deal);
        assert!(late.recv().await.is_ok());
        assert!(a.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_transfer_requires_active_transfer() {
        let registry = DealHandlerRegistry::new(8);
        let handler = registry.create(Uuid::new_v4()).await.unwrap();

        assert!(matches!(
            handler.cancel_transfer(),
            Err(ProvdError::NoActiveTransfer(_))
        ));

        let rx = handler.begin_transfer();
        handler.cancel_transfer().unwrap();
        rx.await.unwrap();
        assert!(!handler.has_active_transfer());

        // Transfer already gone
        drop(handler.begin_transfer());
        assert!(matches!(
            handler.cancel_transfer(),
            Err(ProvdError::NoActiveTransfer(_))
        ));
        assert!(!handler.has_active_transfer());
    }

    #[tokio::test]
    async fn test_retry_gate_consumed_once() {
        let registry = DealHandlerRegistry::new(8);
        let handler = registry.create(Uuid::new_v4()).await.unwrap();
        let shutdown = ShutdownController::new();
        let guard = handler.try_begin_pipeline().unwrap();
        assert!(handler.try_begin_pipeline().is_none());

        // Running but not paused
        assert!(matches!(
            handler.deliver_retry_decision(RetryAction::Resume),
            Err(ProvdError::NotPaused(_))
        ));

        let gate = handler.arm_retry_gate();
        assert!(handler.is_awaiting_retry());
        let waiter = tokio::spawn({
            let handler = Arc::clone(&handler);
            let token = shutdown.token();
            async move { handler.await_retry_decision(gate, &token).await }
        });

        assert_eq!(
            handler.deliver_retry_decision(RetryAction::Fail).unwrap(),
            RetryDelivery::Delivered
        );
        assert_eq!(waiter.await.unwrap(), Some(RetryAction::Fail));

        drop(guard);
        assert!(!handler.is_running());
        assert_eq!(
            handler.deliver_retry_decision(RetryAction::Resume).unwrap(),
            RetryDelivery::Idle
        );
    }

    #[tokio::test]
    async fn test_retry_gate_released_on_shutdown() {
        let registry = DealHandlerRegistry::new(8);
        let handler = registry.create(Uuid::new_v4()).await.unwrap();
        let shutdown = ShutdownController::new();
        let token = shutdown.token();

        let gate = handler.arm_retry_gate();
        shutdown.cancel();
        assert_eq!(handler.await_retry_decision(gate, &token).await, None);
        assert!(!handler.is_awaiting_retry());
    }
}
