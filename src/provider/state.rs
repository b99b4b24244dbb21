//! Run loop's view of held reservations

use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{Checkpoint, ProviderDeal};

/// What one deal holds in the reservation pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reservation {
    /// Bytes tagged in the capacity pool
    pub storage: Option<u64>,
    /// `(collateral, publish_fee)` tagged in the funds pool
    pub funds: Option<(Decimal, Decimal)>,
}

impl Reservation {
    /// What an accepted deal holds while it is in flight. Nothing once it is
    /// announced; no storage until an offline deal's data is imported.
    pub fn claimed_by(deal: &ProviderDeal, publish_fee: Decimal) -> Self {
        if deal.checkpoint >= Checkpoint::CommittedAndAnnounced {
            return Self::default();
        }
        Self {
            storage: (!deal.awaiting_import()).then(|| deal.storage_size()),
            funds: Some((deal.proposal().provider_collateral, publish_fee)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_none() && self.funds.is_none()
    }
}

/// Reservations of all in-flight deals. Owned by the run loop only.
#[derive(Debug, Default)]
pub struct ReservationView {
    held: HashMap<Uuid, Reservation>,
}

impl ReservationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_storage(&mut self, deal_uuid: Uuid, size: u64) {
        self.held.entry(deal_uuid).or_default().storage = Some(size);
    }

    pub fn record_funds(&mut self, deal_uuid: Uuid, collateral: Decimal, publish_fee: Decimal) {
        self.held.entry(deal_uuid).or_default().funds = Some((collateral, publish_fee));
    }

    /// Forget the storage part only
    pub fn clear_storage(&mut self, deal_uuid: Uuid) {
        if let Some(reservation) = self.held.get_mut(&deal_uuid) {
            reservation.storage = None;
            if reservation.is_empty() {
                self.held.remove(&deal_uuid);
            }
        }
    }

    /// Remove and return the deal's reservation. `None` once released.
    pub fn take(&mut self, deal_uuid: Uuid) -> Option<Reservation> {
        self.held.remove(&deal_uuid)
    }

    pub fn get(&self, deal_uuid: Uuid) -> Option<&Reservation> {
        self.held.get(&deal_uuid)
    }

    pub fn storage_total(&self) -> u64 {
        self.held.values().filter_map(|r| r.storage).sum()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
