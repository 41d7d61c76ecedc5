//! Per-VCPU LR-owner handoff (spec §4.4.7): at any moment each occupied
//! LR's `dstate` pointer is owned by exactly one pCPU — the one
//! currently running the LR-owning VCPU. `save_state`/`load_state`
//! bracket a context switch with the `seq_cst` fence that lets a remote
//! `flag_unlocked` (the `NEED_SYNC` assert in [`super::deliver`]) and
//! the incoming owner agree on who is responsible, without a lock.

use core::sync::atomic::{fence, AtomicU32, Ordering};

use super::deliver;
use super::lr::LrShadow;
use super::vic::Vic;

const INVALID: u32 = u32::MAX;

pub struct LrOwner(AtomicU32);

impl LrOwner {
    pub const fn new() -> Self {
        Self(AtomicU32::new(INVALID))
    }

    pub fn current(&self) -> Option<u32> {
        let v = self.0.load(Ordering::Acquire);
        if v == INVALID {
            None
        } else {
            Some(v)
        }
    }

    /// Run on context switch-out: relinquish ownership, fence, then
    /// drain any VIRQs a remote `flag_unlocked` flagged `need_sync`
    /// while this pCPU still held the LRs.
    pub fn save_state(&self, shadow: &mut LrShadow) {
        self.0.store(INVALID, Ordering::Release);
        fence(Ordering::SeqCst);
        deliver::sync_lrs(shadow);
    }

    /// Run on context switch-in: claim ownership, fence, then pick up
    /// whatever accumulated on this VCPU's VIRQs while it wasn't
    /// running (the fence pairs with a concurrent `flag_unlocked`: either
    /// it observed the old `INVALID` owner and IPI'd nobody, in which
    /// case this sweep picks the VIRQ up directly, or it observed `self`
    /// already and sent an IPI this pCPU will also see).
    pub fn load_state(&self, pcpu: u32, vic: &Vic, shadow: &mut LrShadow, elrsr: u32) {
        self.0.store(pcpu, Ordering::Release);
        fence(Ordering::SeqCst);
        vic.find_pending_and_list(pcpu, shadow, elrsr);
    }
}

impl Default for LrOwner {
    fn default() -> Self {
        Self::new()
    }
}
