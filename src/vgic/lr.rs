//! List-register shadow and allocation.
//!
//! `LrShadow` is the per-VCPU `vgic_lrs[LR_COUNT]` array from spec §3:
//! each occupied slot pairs a GICv3 list-register encoding with the
//! `Dstate` it is currently listing, so `sync`/EOI processing can find
//! the VIRQ a hardware-reported LR bit refers to without a reverse
//! lookup table.

use alloc::sync::Arc;

use crate::arch::aarch64::defs::{LR_HW_BIT, LR_PINTID_SHIFT, LR_PRIORITY_SHIFT, LR_STATE_SHIFT, LR_VINTID_MASK};
use crate::config::LR_COUNT;

use super::dstate::Dstate;

/// GICv3 list-register state field (bits [63:62]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrState {
    Invalid,
    Pending,
    Active,
    PendingActive,
}

impl LrState {
    fn bits(self) -> u64 {
        match self {
            LrState::Invalid => 0b00,
            LrState::Pending => 0b01,
            LrState::Active => 0b10,
            LrState::PendingActive => 0b11,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => LrState::Invalid,
            0b01 => LrState::Pending,
            0b10 => LrState::Active,
            _ => LrState::PendingActive,
        }
    }
}

/// Build a list-register encoding. `hw` carries the physical INTID for
/// hardware-forwarded VIRQs (spec: "HW=1 only if the source is a
/// `vgic_forward_spi` whose hw state CAS'd from `active -> listed`").
pub fn encode(vintid: u32, priority: u8, state: LrState, hw_pintid: Option<u32>) -> u64 {
    let mut word = (vintid as u64) & LR_VINTID_MASK;
    word |= (priority as u64) << LR_PRIORITY_SHIFT;
    word |= state.bits() << LR_STATE_SHIFT;
    if let Some(pintid) = hw_pintid {
        word |= LR_HW_BIT;
        word |= ((pintid as u64) & 0x3FF) << LR_PINTID_SHIFT;
    }
    word
}

pub fn decode_state(lr: u64) -> LrState {
    LrState::from_bits(lr >> LR_STATE_SHIFT)
}

pub fn decode_vintid(lr: u64) -> u32 {
    (lr & LR_VINTID_MASK) as u32
}

pub fn is_hw(lr: u64) -> bool {
    lr & LR_HW_BIT != 0
}

#[derive(Clone)]
struct Slot {
    lr: u64,
    dstate: Option<Arc<Dstate>>,
}

impl Slot {
    const fn empty() -> Self {
        Self { lr: 0, dstate: None }
    }
}

/// One VCPU's list registers plus the lazy-allocation search bitmaps
/// from spec §4.4.1: `search_prios` (one bit per priority band) and
/// `search_ranges_low[prio]` (one bit per range of the SPI/PPI space),
/// letting `find_pending_and_list` skip straight to a priority/range
/// that actually has something waiting instead of sweeping every VIRQ.
pub struct LrShadow {
    slots: [Slot; LR_COUNT],
    search_prios: u32,
    search_ranges: [u32; crate::config::PRIORITY_BANDS],
}

impl LrShadow {
    pub const fn new() -> Self {
        const EMPTY: Slot = Slot::empty();
        Self {
            slots: [EMPTY; LR_COUNT],
            search_prios: 0,
            search_ranges: [0; crate::config::PRIORITY_BANDS],
        }
    }

    pub fn raw(&self, idx: usize) -> u64 {
        self.slots[idx].lr
    }

    pub fn dstate_at(&self, idx: usize) -> Option<&Arc<Dstate>> {
        self.slots[idx].dstate.as_ref()
    }

    /// Find a slot to deliver into, per spec §4.4.2 step 2: first any
    /// slot whose `dstate` is null; else any whose hardware ELRSR bit
    /// is set (the LR has already retired); else the lowest-priority
    /// occupied slot whose stored priority is strictly greater
    /// (numerically, i.e. lower priority) than `new_priority`.
    pub fn find_lr_for(&self, elrsr: u32, new_priority: u8) -> Option<usize> {
        for (i, s) in self.slots.iter().enumerate() {
            if s.dstate.is_none() {
                return Some(i);
            }
        }
        for i in 0..LR_COUNT {
            if elrsr & (1 << i) != 0 {
                return Some(i);
            }
        }
        let mut worst: Option<(usize, u8)> = None;
        for (i, s) in self.slots.iter().enumerate() {
            let prio = ((s.lr >> LR_PRIORITY_SHIFT) & 0xFF) as u8;
            if prio > new_priority {
                match worst {
                    Some((_, wp)) if wp >= prio => {}
                    _ => worst = Some((i, prio)),
                }
            }
        }
        worst.map(|(i, _)| i)
    }

    pub fn occupy(&mut self, idx: usize, lr: u64, dstate: Arc<Dstate>) -> Option<(u64, Arc<Dstate>)> {
        let old = core::mem::replace(&mut self.slots[idx], Slot { lr, dstate: Some(dstate) });
        old.dstate.map(|d| (old.lr, d))
    }

    pub fn vacate(&mut self, idx: usize) -> Option<(u64, Arc<Dstate>)> {
        let old = core::mem::replace(&mut self.slots[idx], Slot::empty());
        old.dstate.map(|d| (old.lr, d))
    }

    pub fn set_raw(&mut self, idx: usize, lr: u64) {
        self.slots[idx].lr = lr;
    }

    pub fn iter_occupied(&self) -> impl Iterator<Item = (usize, u64, &Arc<Dstate>)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.dstate.as_ref().map(|d| (i, s.lr, d)))
    }

    pub fn mark_search(&mut self, priority_band: usize, range: usize) {
        self.search_prios |= 1 << priority_band;
        if priority_band < self.search_ranges.len() {
            self.search_ranges[priority_band] |= 1 << range;
        }
    }

    pub fn clear_search(&mut self, priority_band: usize, range: usize) {
        if priority_band < self.search_ranges.len() {
            self.search_ranges[priority_band] &= !(1 << range);
            if self.search_ranges[priority_band] == 0 {
                self.search_prios &= !(1 << priority_band);
            }
        }
    }

    pub fn has_search_pending(&self) -> bool {
        self.search_prios != 0
    }
}

impl Default for LrShadow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_picks_empty_slot() {
        let shadow = LrShadow::new();
        assert_eq!(shadow.find_lr_for(0, 0x80), Some(0));
    }

    #[test]
    fn occupied_lower_priority_is_evicted() {
        let mut shadow = LrShadow::new();
        for i in 0..LR_COUNT {
            let lr = encode(100 + i as u32, 0xF0, LrState::Pending, None);
            shadow.occupy(i, lr, Arc::new(Dstate::new()));
        }
        // every slot now occupied at priority 0xF0 (low); a 0x10 (high
        // priority) delivery should evict one of them.
        assert!(shadow.find_lr_for(0, 0x10).is_some());
    }

    #[test]
    fn no_slot_available_for_equal_or_higher_priority() {
        let mut shadow = LrShadow::new();
        for i in 0..LR_COUNT {
            let lr = encode(100 + i as u32, 0x10, LrState::Pending, None);
            shadow.occupy(i, lr, Arc::new(Dstate::new()));
        }
        assert!(shadow.find_lr_for(0, 0x10).is_none());
    }
}
