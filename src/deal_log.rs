//! Per-deal structured logging
//!
//! Control flow reports what happens to a deal through a [`DealLogger`]
//! instead of calling `tracing` directly. The default sink forwards to
//! `tracing`; tests install [`MemoryDealLogger`] and assert on the events.

use rust_decimal::Decimal;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{Checkpoint, RetryPolicy, SlotNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealLogLevel {
    Info,
    Warn,
    Error,
}

/// Something worth recording about one deal
#[derive(Debug, Clone, PartialEq)]
pub enum DealLogEvent {
    ProposalReceived { peer: String },
    ValidationFailed { reason: String },
    Rejected { reason: String },
    Accepted { offline: bool },
    ImportRequested { path: PathBuf },
    Imported,
    AcceptanceFailed { error: String },
    AwaitingImport,
    AwaitingManualRetry,
    Resumed { checkpoint: Checkpoint },
    RestartFailed { error: String },
    CheckpointReached { checkpoint: Checkpoint },
    Paused { error: String, retry: RetryPolicy },
    Failed { error: String },
    StorageUntagged,
    FundsUntagged { collateral: Decimal, publish_fee: Decimal },
    UntagFailed { error: String },
    TransferStarted,
    TransferCancelled,
    TransferCancelFailed { error: String },
    CommitRetry { error: String },
    Committed { slot: SlotNumber, offset: u64 },
    SlotFinalized { slot: SlotNumber },
}

impl DealLogEvent {
    pub fn level(&self) -> DealLogLevel {
        match self {
            DealLogEvent::AcceptanceFailed { .. }
            | DealLogEvent::RestartFailed { .. }
            | DealLogEvent::Failed { .. }
            | DealLogEvent::UntagFailed { .. } => DealLogLevel::Error,
            DealLogEvent::Paused { .. }
            | DealLogEvent::TransferCancelFailed { .. }
            | DealLogEvent::CommitRetry { .. } => DealLogLevel::Warn,
            _ => DealLogLevel::Info,
        }
    }
}

impl fmt::Display for DealLogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DealLogEvent::ProposalReceived { peer } => {
                write!(f, "executing deal proposal received from network (peer={peer})")
            }
            DealLogEvent::ValidationFailed { reason } => {
                write!(f, "deal proposal failed validation: {reason}")
            }
            DealLogEvent::Rejected { reason } => write!(f, "deal rejected by provider: {reason}"),
            DealLogEvent::Accepted { offline: true } => {
                write!(f, "offline deal accepted, waiting for data import")
            }
            DealLogEvent::Accepted { offline: false } => {
                write!(f, "deal accepted and scheduled for execution")
            }
            DealLogEvent::ImportRequested { path } => {
                write!(f, "import data for offline deal (path={})", path.display())
            }
            DealLogEvent::Imported => {
                write!(f, "offline deal data imported and deal scheduled for execution")
            }
            DealLogEvent::AcceptanceFailed { error } => {
                write!(f, "failed to send deal for acceptance: {error}")
            }
            DealLogEvent::AwaitingImport => {
                write!(f, "restarted deal: waiting for offline deal data import")
            }
            DealLogEvent::AwaitingManualRetry => {
                write!(f, "deal must be manually restarted: waiting for manual restart")
            }
            DealLogEvent::Resumed { checkpoint } => {
                write!(f, "resuming deal on restart (checkpoint={checkpoint})")
            }
            DealLogEvent::RestartFailed { error } => write!(f, "failed to restart deal: {error}"),
            DealLogEvent::CheckpointReached { checkpoint } => {
                write!(f, "deal reached checkpoint {checkpoint}")
            }
            DealLogEvent::Paused { error, retry } => {
                write!(f, "deal paused (retry={retry}): {error}")
            }
            DealLogEvent::Failed { error } => write!(f, "deal failed: {error}"),
            DealLogEvent::StorageUntagged => write!(f, "untagged storage space"),
            DealLogEvent::FundsUntagged {
                collateral,
                publish_fee,
            } => write!(
                f,
                "untagged funds for deal as deal has finished (collateral={collateral}, publish={publish_fee})"
            ),
            DealLogEvent::UntagFailed { error } => write!(f, "failed to untag resources: {error}"),
            DealLogEvent::TransferStarted => write!(f, "data transfer started"),
            DealLogEvent::TransferCancelled => write!(f, "deal data transfer cancelled by user"),
            DealLogEvent::TransferCancelFailed { error } => write!(
                f,
                "error when user tried to cancel deal data transfer: {error}"
            ),
            DealLogEvent::CommitRetry { error } => {
                write!(f, "failed to commit deal payload, will retry: {error}")
            }
            DealLogEvent::Committed { slot, offset } => {
                write!(f, "added new deal to slot {slot} at offset {offset}")
            }
            DealLogEvent::SlotFinalized { slot } => write!(f, "slot {slot} finalized"),
        }
    }
}

/// Side-channel sink for deal events. Must not block.
pub trait DealLogger: Send + Sync {
    fn log(&self, deal_uuid: Uuid, event: DealLogEvent);
}

/// Forwards deal events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDealLogger;

impl DealLogger for TracingDealLogger {
    fn log(&self, deal_uuid: Uuid, event: DealLogEvent) {
        match event.level() {
            DealLogLevel::Info => info!(%deal_uuid, "{}", event),
            DealLogLevel::Warn => warn!(%deal_uuid, "{}", event),
            DealLogLevel::Error => error!(%deal_uuid, "{}", event),
        }
    }
}

/// Records every event in memory
#[derive(Debug, Default)]
pub struct MemoryDealLogger {
    events: Mutex<Vec<(Uuid, DealLogEvent)>>,
}

impl MemoryDealLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, deal_uuid: Uuid) -> Vec<DealLogEvent> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|(id, _)| *id == deal_uuid)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, deal_uuid: Uuid, pred: impl Fn(&DealLogEvent) -> bool) -> bool {
        self.events_for(deal_uuid).iter().any(pred)
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DealLogger for MemoryDealLogger {
    fn log(&self, deal_uuid: Uuid, event: DealLogEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((deal_uuid, event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_filters_by_deal() {
        let logger = MemoryDealLogger::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        logger.log(a, DealLogEvent::Accepted { offline: false });
        logger.log(b, DealLogEvent::AwaitingImport);
        logger.log(a, DealLogEvent::StorageUntagged);

        assert_eq!(logger.len(), 3);
        assert_eq!(
            logger.events_for(a),
            vec![
                DealLogEvent::Accepted { offline: false },
                DealLogEvent::StorageUntagged
            ]
        );
        assert!(logger.contains(b, |e| matches!(e, DealLogEvent::AwaitingImport)));
    }

    #[test]
    fn test_levels() {
        assert_eq!(
            DealLogEvent::Rejected {
                reason: "full".into()
            }
            .level(),
            DealLogLevel::Info
        );
        assert_eq!(
            DealLogEvent::CommitRetry {
                error: "busy".into()
            }
            .level(),
            DealLogLevel::Warn
        );
        assert_eq!(
            DealLogEvent::Failed {
                error: "boom".into()
            }
            .level(),
            DealLogLevel::Error
        );
    }
}
