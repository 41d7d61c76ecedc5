//! Hardware IRQ bindings: the `HW-IRQ` entity from spec §3, used to
//! forward a physical SPI or per-CPU PPI into a VIRQ.

use core::sync::atomic::{AtomicU8, Ordering};

/// What a physical interrupt's hypervisor-side trap does when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwIrqAction {
    VgicForwardSpi,
    VgicForwardPrivate,
    VgicMaintenance,
    HypTimerLp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HwIrqState {
    Inactive = 0,
    Active = 1,
    Listed = 2,
}

/// A hardware interrupt bound to forward into a VIRQ. `state` tracks
/// the physical-side lifecycle independent of the VIRQ's own dstate:
/// per spec §3 invariant (c), only a transition into `Inactive` may
/// call the physical `irq_deactivate`.
pub struct HwIrq {
    pub pintid: u32,
    pub action: HwIrqAction,
    pub virq: u32,
    state: AtomicU8,
}

impl HwIrq {
    pub fn new(pintid: u32, action: HwIrqAction, virq: u32) -> Self {
        Self {
            pintid,
            action,
            virq,
            state: AtomicU8::new(HwIrqState::Inactive as u8),
        }
    }

    pub fn state(&self) -> HwIrqState {
        match self.state.load(Ordering::Acquire) {
            1 => HwIrqState::Active,
            2 => HwIrqState::Listed,
            _ => HwIrqState::Inactive,
        }
    }

    /// CAS `Active -> Listed`, the transition spec §4.4.2 step 3 gates
    /// setting the LR's HW bit on. Returns whether it succeeded.
    pub fn try_list(&self) -> bool {
        self.state
            .compare_exchange(
                HwIrqState::Active as u8,
                HwIrqState::Listed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_active(&self) {
        self.state.store(HwIrqState::Active as u8, Ordering::Release);
    }

    /// Transition to `Inactive`; the only path that may call the
    /// physical deactivate. The physical call itself is a platform
    /// concern outside this crate's core and is left to the caller.
    pub fn deactivate(&self) {
        self.state.store(HwIrqState::Inactive as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_to_listed_transition_succeeds_once() {
        let hw = HwIrq::new(200, HwIrqAction::VgicForwardSpi, 300);
        hw.mark_active();
        assert!(hw.try_list());
        assert_eq!(hw.state(), HwIrqState::Listed);
        assert!(!hw.try_list());
    }

    #[test]
    fn deactivate_resets_from_any_state() {
        let hw = HwIrq::new(201, HwIrqAction::VgicForwardPrivate, 301);
        hw.mark_active();
        hw.deactivate();
        assert_eq!(hw.state(), HwIrqState::Inactive);
    }
}
