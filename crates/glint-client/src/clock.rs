//! Wall-clock slot sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use glint_core::types::spec::ChainSpec;

/// Tells the client which slot the chain is at.
pub trait SlotClock: Send + Sync {
    fn now_slot(&self) -> u64;
}

/// Slot derived from the system time and the chain's genesis.
#[derive(Clone, Debug)]
pub struct SystemSlotClock {
    spec: ChainSpec,
}

impl SystemSlotClock {
    pub fn new(spec: &ChainSpec) -> Self {
        Self { spec: spec.clone() }
    }
}

impl SlotClock for SystemSlotClock {
    fn now_slot(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.spec.slot_at_time(now)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualSlotClock {
    slot: AtomicU64,
}

impl ManualSlotClock {
    pub fn new(slot: u64) -> Self {
        Self {
            slot: AtomicU64::new(slot),
        }
    }

    pub fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn advance(&self, slots: u64) {
        self.slot.fetch_add(slots, Ordering::SeqCst);
    }
}

impl SlotClock for ManualSlotClock {
    fn now_slot(&self) -> u64 {
        self.slot.load(Ordering::SeqCst)
    }
}
