//! GICR WAKER: `ProcessorSleep` / `ChildrenAsleep` per-pCPU draining
//! state (spec §4.4.5). The teacher's `devices::gic::redistributor`
//! carries a `WAKER` register but treats it as inert storage; this is
//! the state machine that actually gates `Vic::virq_assert` on it.

use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakerState {
    Awake,
    /// Guest set `ProcessorSleep`; no new VIRQs may be delivered, but
    /// LRs already listed on this pCPU haven't necessarily delisted yet.
    Draining,
    /// Every LR delisted while draining — `ChildrenAsleep` is reportable.
    Asleep,
}

const AWAKE: u8 = 0;
const DRAINING: u8 = 1;
const ASLEEP: u8 = 2;

pub struct Waker(AtomicU8);

impl Waker {
    pub const fn new() -> Self {
        Self(AtomicU8::new(AWAKE))
    }

    pub fn state(&self) -> WakerState {
        match self.0.load(Ordering::Acquire) {
            DRAINING => WakerState::Draining,
            ASLEEP => WakerState::Asleep,
            _ => WakerState::Awake,
        }
    }

    /// Guest set `GICR_WAKER.ProcessorSleep`.
    pub fn request_sleep(&self) {
        self.0.store(DRAINING, Ordering::Release);
    }

    /// Caller has observed no LR is occupied on this pCPU anymore;
    /// report `ChildrenAsleep` to the guest.
    pub fn confirm_asleep(&self) {
        let _ = self.0.compare_exchange(DRAINING, ASLEEP, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Guest cleared `GICR_WAKER.ProcessorSleep`. Returns whether this
    /// actually left a sleeping/draining state, so the caller knows to
    /// run `find_pending_and_list`.
    pub fn clear_sleep(&self) -> bool {
        self.0.swap(AWAKE, Ordering::AcqRel) != AWAKE
    }

    pub fn gates_delivery(&self) -> bool {
        self.state() != WakerState::Awake
    }
}

impl Default for Waker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_then_drain_then_wake_resets() {
        let w = Waker::new();
        assert!(!w.gates_delivery());
        w.request_sleep();
        assert_eq!(w.state(), WakerState::Draining);
        assert!(w.gates_delivery());
        w.confirm_asleep();
        assert_eq!(w.state(), WakerState::Asleep);
        assert!(w.clear_sleep());
        assert_eq!(w.state(), WakerState::Awake);
        assert!(!w.gates_delivery());
    }

    #[test]
    fn confirm_asleep_is_a_noop_when_not_draining() {
        let w = Waker::new();
        w.confirm_asleep();
        assert_eq!(w.state(), WakerState::Awake);
    }

    #[test]
    fn clear_sleep_reports_whether_it_changed_anything() {
        let w = Waker::new();
        assert!(!w.clear_sleep());
        w.request_sleep();
        assert!(w.clear_sleep());
    }
}
