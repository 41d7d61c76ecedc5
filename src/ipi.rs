//! Inter-processor interrupts: the mechanism the VGIC uses to kick a
//! remote pCPU into re-evaluating its LR shadow or SGI queue, spec §6's
//! `ipi_one/ipi_others/ipi_clear`.
//!
//! Physically raising an IPI is a platform concern (a GICD_SGIR-style
//! write or a board-specific mailbox); this module only owns the
//! per-pCPU reason bitmap the receiving side drains. Grounded on
//! [`crate::percpu`]'s fixed per-pCPU array, generalized from one
//! scheduling context per pCPU to one atomic reason bitmap per pCPU.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::MAX_SMP_CPUS;

/// Why a pCPU was sent an IPI. Bits so a single word can carry more
/// than one pending reason between send and drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum IpiReason {
    VgicDeliver = 1 << 0,
    VgicSync = 1 << 1,
    VgicSgi = 1 << 2,
    Idle = 1 << 3,
}

/// Lets the physical send be swapped out in tests without pulling in a
/// real GIC distributor.
pub trait IpiSender {
    fn send(&self, pcpu: u32);
}

pub struct IpiState {
    pending: [AtomicU32; MAX_SMP_CPUS],
}

impl IpiState {
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            pending: [ZERO; MAX_SMP_CPUS],
        }
    }

    /// `ipi_one`: record `reason` as pending for `pcpu` and physically
    /// raise the interrupt via `sender`.
    pub fn ipi_one(&self, sender: &dyn IpiSender, pcpu: u32, reason: IpiReason) {
        let idx = pcpu as usize;
        if idx >= MAX_SMP_CPUS {
            return;
        }
        self.pending[idx].fetch_or(reason as u32, Ordering::AcqRel);
        sender.send(pcpu);
    }

    /// `ipi_others`: every pCPU except `self_pcpu`.
    pub fn ipi_others(&self, sender: &dyn IpiSender, self_pcpu: u32, reason: IpiReason) {
        for idx in 0..MAX_SMP_CPUS {
            if idx as u32 == self_pcpu {
                continue;
            }
            self.ipi_one(sender, idx as u32, reason);
        }
    }

    /// `ipi_clear`: the receiving pCPU acknowledges `reason` is
    /// handled. Returns whether it had actually been pending, so a
    /// caller can distinguish a spurious wakeup.
    pub fn ipi_clear(&self, pcpu: u32, reason: IpiReason) -> bool {
        let idx = pcpu as usize;
        if idx >= MAX_SMP_CPUS {
            return false;
        }
        let prev = self.pending[idx].fetch_and(!(reason as u32), Ordering::AcqRel);
        prev & (reason as u32) != 0
    }

    /// All reasons currently pending for `pcpu`, for a receiver that
    /// wants to drain everything in one pass instead of probing each
    /// reason individually.
    pub fn pending_for(&self, pcpu: u32) -> u32 {
        let idx = pcpu as usize;
        if idx >= MAX_SMP_CPUS {
            return 0;
        }
        self.pending[idx].load(Ordering::Acquire)
    }
}

impl Default for IpiState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    struct RecordingSender {
        sent: RefCell<Vec<u32>>,
    }

    impl IpiSender for RecordingSender {
        fn send(&self, pcpu: u32) {
            self.sent.borrow_mut().push(pcpu);
        }
    }

    #[test]
    fn ipi_one_marks_pending_and_sends() {
        let state = IpiState::new();
        let sender = RecordingSender { sent: RefCell::new(Vec::new()) };
        state.ipi_one(&sender, 2, IpiReason::VgicSync);
        assert_eq!(sender.sent.borrow().as_slice(), &[2]);
        assert_eq!(state.pending_for(2), IpiReason::VgicSync as u32);
    }

    #[test]
    fn ipi_others_skips_self() {
        let state = IpiState::new();
        let sender = RecordingSender { sent: RefCell::new(Vec::new()) };
        state.ipi_others(&sender, 1, IpiReason::VgicDeliver);
        assert!(!sender.sent.borrow().contains(&1));
        assert!(sender.sent.borrow().contains(&0));
    }

    #[test]
    fn ipi_clear_reports_whether_it_was_pending() {
        let state = IpiState::new();
        let sender = RecordingSender { sent: RefCell::new(Vec::new()) };
        state.ipi_one(&sender, 0, IpiReason::VgicSgi);
        assert!(state.ipi_clear(0, IpiReason::VgicSgi));
        assert!(!state.ipi_clear(0, IpiReason::VgicSgi));
    }
}
