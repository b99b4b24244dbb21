//! File-backed piece committer
//!
//! Each committed payload is written to its own slot file under
//! `slots_dir`. A slot stays `Sealing` for `seal_delay` and then reports
//! `Sealed`. While `max_pending` slots are still sealing, new commits are
//! refused with `SlotsSaturated`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::SlotNumber;
use crate::error::{ProvdError, Result};
use crate::provider::{CommitInfo, PayloadReader, PieceCommitter, SlotState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitterConfig {
    pub slots_dir: PathBuf,
    /// Slots allowed to be sealing at the same time
    pub max_pending: usize,
    #[serde(with = "crate::config::duration_secs")]
    pub seal_delay: Duration,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            slots_dir: PathBuf::from("data/slots"),
            max_pending: 8,
            seal_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    state: SlotState,
    sealed_at: Instant,
}

#[derive(Debug, Default)]
struct Slots {
    next: SlotNumber,
    entries: HashMap<SlotNumber, SlotEntry>,
}

impl Slots {
    /// Promote slots whose seal delay has passed
    fn refresh(&mut self, now: Instant) {
        for entry in self.entries.values_mut() {
            if entry.state == SlotState::Sealing && now >= entry.sealed_at {
                entry.state = SlotState::Sealed;
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.state, SlotState::Pending | SlotState::Sealing))
            .count()
    }
}

#[derive(Debug)]
pub struct FsCommitter {
    config: CommitterConfig,
    slots: Mutex<Slots>,
}

impl FsCommitter {
    pub async fn new(config: CommitterConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.slots_dir).await?;
        Ok(Self {
            config,
            slots: Mutex::new(Slots {
                next: 1,
                entries: HashMap::new(),
            }),
        })
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn slot_path(&self, slot: SlotNumber) -> PathBuf {
        self.config.slots_dir.join(format!("slot-{slot}.car"))
    }

    /// Reserve the next slot number, or refuse when too many are in flight
    fn reserve_slot(&self) -> Result<SlotNumber> {
        let mut slots = self.slots();
        slots.refresh(Instant::now());
        if slots.in_flight() >= self.config.max_pending {
            return Err(ProvdError::SlotsSaturated);
        }
        let slot = slots.next;
        slots.next += 1;
        slots.entries.insert(
            slot,
            SlotEntry {
                state: SlotState::Pending,
                sealed_at: Instant::now(),
            },
        );
        Ok(slot)
    }

    fn set_state(&self, slot: SlotNumber, state: SlotState) {
        let mut slots = self.slots();
        if let Some(entry) = slots.entries.get_mut(&slot) {
            entry.state = state;
            entry.sealed_at = Instant::now() + self.config.seal_delay;
        }
    }

    async fn write_payload(path: &Path, size: u64, mut payload: PayloadReader) -> Result<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(&mut payload, &mut file).await?;
        file.flush().await?;
        if written < size {
            return Err(ProvdError::Commit(format!(
                "payload has {written} bytes, expected {size}"
            )));
        }
        Ok(written)
    }
}

#[async_trait]
impl PieceCommitter for FsCommitter {
    async fn commit(
        &self,
        size: u64,
        payload: PayloadReader,
        info: &CommitInfo,
    ) -> Result<(SlotNumber, u64)> {
        let slot = self.reserve_slot()?;
        let path = self.slot_path(slot);

        match Self::write_payload(&path, size, payload).await {
            Ok(written) => {
                self.set_state(slot, SlotState::Sealing);
                info!(
                    deal_uuid = %info.deal_uuid,
                    slot,
                    bytes = written,
                    piece_cid = %info.piece_cid,
                    "payload written to slot"
                );
                Ok((slot, 0))
            }
            Err(e) => {
                self.set_state(slot, SlotState::Failed);
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    async fn slot_status(&self, slot: SlotNumber) -> Result<SlotState> {
        let mut slots = self.slots();
        slots.refresh(Instant::now());
        let state = slots
            .entries
            .get(&slot)
            .map(|e| e.state)
            .ok_or_else(|| ProvdError::Commit(format!("unknown slot {slot}")))?;
        debug!(slot, ?state, "slot status");
        Ok(state)
    }
}
