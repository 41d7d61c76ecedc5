//! Deliver / undeliver / sync / defer: the VIRQ state machine from
//! spec §4.4.2-§4.4.4, operating over a [`Dstate`] and a target
//! [`LrShadow`]. Kept free of `Vic`/`Vcpu` so it can be unit tested
//! without constructing a whole VM; [`super::vic::Vic`] is the part
//! that knows which VCPU currently owns a VIRQ and wires IPIs.

use alloc::sync::Arc;

use super::dstate::{Dstate, DstateFlags};
use super::lr::{self, LrShadow, LrState};

/// Outcome of a [`deliver`] call: tells the caller (which owns
/// scheduling/IPI facilities `deliver` itself doesn't touch) what
/// follow-up action is needed.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// The VIRQ was already listed; `need_sync` was set and the owning
    /// pCPU should be sent a sync IPI (or, if `route_may_have_changed`,
    /// every pCPU should be considered).
    AlreadyListed,
    /// Installed into list register `lr_index` on the target VCPU.
    Listed { lr_index: usize },
    /// No LR was available; search bitmaps were marked so a future
    /// `find_pending_and_list` (or maintenance IRQ) picks it up.
    Deferred,
    /// The VIRQ is not enabled or not pending after the assert; nothing
    /// to do.
    NotPending,
}

/// spec §4.4.2. `priority_band`/`range` locate this VIRQ in the
/// target's two-level search bitmap (computed by the caller from the
/// VIRQ number and its current priority).
#[allow(clippy::too_many_arguments)]
pub fn deliver(
    virq_num: u32,
    dstate: &Arc<Dstate>,
    target: &mut LrShadow,
    elrsr: u32,
    assert_flags: DstateFlags,
    hw_pintid: Option<u32>,
    priority_band: usize,
    range: usize,
) -> DeliverOutcome {
    let (prev, priority) = dstate.assert(assert_flags);
    if prev.contains(DstateFlags::LISTED) {
        dstate.assert(DstateFlags::NEED_SYNC);
        return DeliverOutcome::AlreadyListed;
    }

    let now = prev | assert_flags;
    if !now.contains(DstateFlags::ENABLED) || !Dstate::pending(now) {
        return DeliverOutcome::NotPending;
    }

    let Some(idx) = target.find_lr_for(elrsr, priority) else {
        target.mark_search(priority_band, range);
        return DeliverOutcome::Deferred;
    };

    if let Some((old_lr, old_dstate)) = target.vacate(idx) {
        defer(&old_dstate, old_lr);
    }

    let encoded = lr::encode(virq_num, priority, LrState::Pending, hw_pintid);
    target.occupy(idx, encoded, dstate.clone());
    dstate.assert(DstateFlags::LISTED);
    dstate.clear(DstateFlags::EDGE);
    DeliverOutcome::Listed { lr_index: idx }
}

/// spec §4.4.3 `undeliver`. `force_reclaim` additionally clears
/// `active` even if the LR has not retired, used when destroying a
/// VIRQ's binding outright.
pub fn undeliver(dstate: &Arc<Dstate>, target: &mut Option<(&mut LrShadow, usize)>, clear_flags: DstateFlags, force_reclaim: bool) {
    let (prev, _) = dstate.clear(clear_flags);
    if prev.contains(DstateFlags::LEVEL_SRC) {
        dstate.clear(DstateFlags::LEVEL_SRC);
    }
    if let Some((shadow, idx)) = target {
        let flags = dstate.flags();
        if !Dstate::pending(flags) || force_reclaim {
            shadow.vacate(*idx);
            dstate.clear(DstateFlags::LISTED | DstateFlags::ACTIVE);
        } else {
            let lr = shadow.raw(*idx);
            shadow.set_raw(*idx, lr::encode(lr::decode_vintid(lr), dstate.priority(), LrState::Pending, None));
        }
    } else if dstate.flags().contains(DstateFlags::LISTED) {
        dstate.assert(DstateFlags::NEED_SYNC);
    }
}

/// spec §4.4.3 `defer`: the VIRQ held an active interrupt in an LR that
/// is being reclaimed for something else. Pushing to an explicit
/// "active-unlisted" stack (spec's wording) is simplified here to
/// re-marking the dstate so a later sync/EOI pass re-lists or
/// deactivates it; no separate stack structure is needed since the
/// dstate's own `ACTIVE`/`LISTED` bits already encode that state.
pub fn defer(dstate: &Arc<Dstate>, old_lr: u64) {
    dstate.clear(DstateFlags::LISTED);
    if lr::decode_state(old_lr) == LrState::Active || lr::decode_state(old_lr) == LrState::PendingActive {
        dstate.assert(DstateFlags::ACTIVE);
    }
    if Dstate::pending(dstate.flags()) {
        dstate.assert(DstateFlags::NEED_SYNC);
    }
}

/// spec §4.4.3 `sync`: walk the VCPU's LRs; any VIRQ flagged
/// `need_sync` or `hw_detached` is either rewritten in place (still
/// enabled and pending) or invalidated (and deferred if it still needs
/// to complete in software).
pub fn sync_lrs(shadow: &mut LrShadow) {
    let stale: alloc::vec::Vec<(usize, u64, Arc<Dstate>)> = shadow
        .iter_occupied()
        .filter(|(_, _, d)| d.flags().intersects(DstateFlags::NEED_SYNC | DstateFlags::HW_DETACHED))
        .map(|(i, lr, d)| (i, lr, d.clone()))
        .collect();

    for (idx, old_lr, dstate) in stale {
        dstate.clear(DstateFlags::NEED_SYNC | DstateFlags::HW_DETACHED);
        let flags = dstate.flags();
        if flags.contains(DstateFlags::ENABLED) && Dstate::pending(flags) {
            shadow.set_raw(idx, lr::encode(lr::decode_vintid(old_lr), dstate.priority(), LrState::Pending, None));
        } else {
            shadow.vacate(idx);
            defer(&dstate, old_lr);
        }
    }
}
