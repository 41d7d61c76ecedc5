//! Virtual Interrupt Controller: the VIRQ table, routing cache, and
//! GICD/GICR register emulation tied together. Generalizes the
//! teacher's standalone `devices::gic::{VirtualGicd, VirtualGicr}`
//! (pure register files with no delivery logic behind them) by wiring
//! their writes into the [`dstate`]/[`deliver`] machinery, per spec
//! §4.4.5.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::MAX_VIRQS;
use crate::devices::gic::VirtualGicd;
use crate::sync::SpinLock;

use super::deliver::{self, DeliverOutcome};
use super::dstate::{Dstate, DstateFlags};
use super::hwirq::{HwIrq, HwIrqAction};
use super::lr::LrShadow;
use super::sgi::PendingSgis;
use super::waker::{Waker, WakerState};

const UNROUTED: u32 = u32::MAX;

/// What's plugged into a VIRQ's physical side. A shared SPI forwards a
/// single physical source; a forwarded PPI needs one source per pCPU
/// since a PPI is physically per-core (spec §4.4.6).
enum HwBinding {
    None,
    Shared(Arc<HwIrq>),
    PerCpu(Box<[Option<Arc<HwIrq>>]>),
}

struct VirqEntry {
    dstate: Arc<Dstate>,
    /// Target VCPU id this VIRQ currently routes to. For SPIs this
    /// mirrors `GICD_IROUTER`; for SGIs/PPIs it is fixed at bind time.
    route: AtomicU32,
    hwirq: SpinLock<HwBinding>,
}

impl VirqEntry {
    fn new() -> Self {
        Self {
            dstate: Arc::new(Dstate::new()),
            route: AtomicU32::new(UNROUTED),
            hwirq: SpinLock::new(HwBinding::None),
        }
    }
}

/// One VM's virtual interrupt controller. Owns the VIRQ table, the
/// GICD register shadow, and one WAKER drain state per pCPU; per-VCPU
/// LR shadows live on the `Vcpu`s themselves and are passed in by
/// reference, matching spec's lock order (`vic.gicd_lock >
/// vcpu.vgic_lr_lock`) since callers always take the `Vic`'s lock
/// first.
pub struct Vic {
    virqs: Vec<VirqEntry>,
    gicd: SpinLock<VirtualGicd>,
    attached_vcpus: AtomicU32,
    wakers: Box<[Waker]>,
    sgis: PendingSgis,
}

impl Vic {
    /// `vic_configure`.
    pub fn configure() -> Self {
        let mut virqs = Vec::with_capacity(MAX_VIRQS);
        for _ in 0..MAX_VIRQS {
            virqs.push(VirqEntry::new());
        }
        let mut wakers = Vec::with_capacity(crate::platform::MAX_SMP_CPUS);
        for _ in 0..crate::platform::MAX_SMP_CPUS {
            wakers.push(Waker::new());
        }
        Self {
            virqs,
            gicd: SpinLock::new(VirtualGicd::new()),
            attached_vcpus: AtomicU32::new(0),
            wakers: wakers.into_boxed_slice(),
            sgis: PendingSgis::new(),
        }
    }

    /// `vic_attach_vcpu`.
    pub fn attach_vcpu(&self) -> u32 {
        let id = self.attached_vcpus.fetch_add(1, Ordering::AcqRel);
        self.gicd.lock().set_num_cpus(id + 1);
        id
    }

    fn entry(&self, virq: u32) -> Option<&VirqEntry> {
        self.virqs.get(virq as usize)
    }

    fn waker(&self, pcpu: u32) -> &Waker {
        &self.wakers[pcpu as usize % self.wakers.len()]
    }

    /// `vic_bind_shared`: route an SPI to `target_vcpu` (the same
    /// binding `GICD_IROUTER` writes perform at runtime). Reprograms
    /// the physical `GICD_IROUTER` when a hw-irq is forwarded into this
    /// VIRQ, and forces a sync if the VIRQ is listed under the old
    /// route (spec §4.4.5 scenario 5).
    pub fn bind_shared(&self, virq: u32, target_vcpu: u32) {
        if let Some(e) = self.entry(virq) {
            let prev = e.route.swap(target_vcpu, Ordering::AcqRel);
            if prev == target_vcpu {
                return;
            }
            if e.dstate.flags().contains(DstateFlags::LISTED) {
                e.dstate.assert(DstateFlags::NEED_SYNC);
            }
            if let HwBinding::Shared(hw) = &*e.hwirq.lock() {
                super::phys::reprogram_irouter(hw.pintid, target_vcpu as u64);
            }
        }
    }

    /// `vic_bind_private_vcpu` / `vic_bind_private_index`: an SGI/PPI
    /// is always routed to the VCPU that owns it; both entry points
    /// collapse to the same fixed binding here.
    pub fn bind_private(&self, virq: u32, owning_vcpu: u32) {
        self.bind_shared(virq, owning_vcpu);
    }

    /// `vic_unbind` / `vic_unbind_sync`: clear the route and force the
    /// VIRQ out of whatever LR currently lists it. `sync` additionally
    /// expects the caller to have already quiesced the owning pCPU
    /// (we don't distinguish the two here since `force_reclaim` is
    /// unconditional either way).
    pub fn unbind(&self, virq: u32, listed_on: Option<(&mut LrShadow, usize)>) {
        if let Some(e) = self.entry(virq) {
            e.route.store(UNROUTED, Ordering::Release);
            let mut target = listed_on;
            deliver::undeliver(&e.dstate, &mut target, DstateFlags::all(), true);
        }
    }

    pub fn route_of(&self, virq: u32) -> Option<u32> {
        self.entry(virq).map(|e| e.route.load(Ordering::Acquire)).filter(|&r| r != UNROUTED)
    }

    fn hw_pintid_for(&self, e: &VirqEntry, pcpu: u32) -> Option<u32> {
        match &*e.hwirq.lock() {
            HwBinding::None => None,
            HwBinding::Shared(hw) => hw.try_list().then_some(hw.pintid),
            HwBinding::PerCpu(table) => table
                .get(pcpu as usize)
                .and_then(|slot| slot.as_ref())
                .filter(|hw| hw.try_list())
                .map(|hw| hw.pintid),
        }
    }

    /// `virq_assert`. `pcpu` is the physical CPU the target `LrShadow`
    /// belongs to: it gates delivery against that pCPU's WAKER state
    /// and selects which per-pCPU hw-irq source (if any) is listed.
    pub fn virq_assert(&self, virq: u32, target: &mut LrShadow, elrsr: u32, level: bool, pcpu: u32) -> DeliverOutcome {
        let Some(e) = self.entry(virq) else {
            return DeliverOutcome::NotPending;
        };
        let flags = e.dstate.flags();
        let assert_flags = if flags.contains(DstateFlags::CFG_EDGE) {
            DstateFlags::EDGE
        } else if level {
            DstateFlags::LEVEL_SW
        } else {
            DstateFlags::empty()
        };
        if self.waker(pcpu).gates_delivery() {
            if !assert_flags.is_empty() {
                e.dstate.assert(assert_flags);
            }
            return DeliverOutcome::Deferred;
        }
        let hw_pintid = self.hw_pintid_for(e, pcpu);
        let band = (e.dstate.priority() >> 5) as usize % crate::config::PRIORITY_BANDS;
        let range = (virq as usize / 32) % crate::config::SEARCH_RANGES;
        deliver::deliver(virq, &e.dstate, target, elrsr, assert_flags, hw_pintid, band, range)
    }

    /// `virq_clear`.
    pub fn virq_clear(&self, virq: u32, listed_on: Option<(&mut LrShadow, usize)>) {
        if let Some(e) = self.entry(virq) {
            let mut target = listed_on;
            deliver::undeliver(&e.dstate, &mut target, DstateFlags::EDGE | DstateFlags::LEVEL_SW | DstateFlags::LEVEL_MSG, false);
        }
    }

    /// `virq_query`.
    pub fn virq_query(&self, virq: u32) -> Option<(DstateFlags, u8)> {
        self.entry(virq).map(|e| e.dstate.load())
    }

    pub fn set_enabled(&self, virq: u32, enabled: bool) {
        if let Some(e) = self.entry(virq) {
            if enabled {
                e.dstate.assert(DstateFlags::ENABLED);
            } else {
                e.dstate.clear(DstateFlags::ENABLED);
            }
            self.sync_hw_enable(e, enabled);
        }
    }

    /// Enabling/disabling a forwarded PPI's virtual side must propagate
    /// to the physical GICR ISENABLER0/ICENABLER0 of the pCPU it's
    /// currently routed to (spec §4.4.6: "enabling the physical PPI
    /// when the guest enables the virtual").
    fn sync_hw_enable(&self, e: &VirqEntry, enabled: bool) {
        if let HwBinding::PerCpu(table) = &*e.hwirq.lock() {
            let pcpu = e.route.load(Ordering::Acquire);
            if pcpu == UNROUTED {
                return;
            }
            if let Some(Some(hw)) = table.get(pcpu as usize) {
                super::phys::set_ppi_enabled(pcpu, hw.pintid, enabled);
            }
        }
    }

    /// `GICD_ISPENDR`/`ICPENDR` decomposition: assert/clear the
    /// matching software-pending flag directly on the dstate.
    pub fn set_pending_bit(&self, virq: u32, set: bool) {
        if let Some(e) = self.entry(virq) {
            if set {
                let edge = e.dstate.flags().contains(DstateFlags::CFG_EDGE);
                let flag = if edge { DstateFlags::EDGE } else { DstateFlags::LEVEL_SW };
                let (prev, _) = e.dstate.assert(flag);
                if prev.contains(DstateFlags::LISTED) {
                    e.dstate.assert(DstateFlags::NEED_SYNC);
                }
            } else {
                e.dstate.clear(DstateFlags::EDGE | DstateFlags::LEVEL_SW);
            }
        }
    }

    /// `GICD_ISACTIVER`/`ICACTIVER` decomposition.
    pub fn set_active_bit(&self, virq: u32, set: bool) {
        if let Some(e) = self.entry(virq) {
            if set {
                e.dstate.assert(DstateFlags::ACTIVE);
            } else {
                e.dstate.clear(DstateFlags::ACTIVE);
            }
        }
    }

    /// `GICD_IGROUPR` decomposition. Group changes force a sync if the
    /// VIRQ is currently listed (spec §4.4.5).
    pub fn set_group(&self, virq: u32, group1: bool) {
        if let Some(e) = self.entry(virq) {
            if group1 {
                e.dstate.assert(DstateFlags::GROUP1);
            } else {
                e.dstate.clear(DstateFlags::GROUP1);
            }
            if e.dstate.flags().contains(DstateFlags::LISTED) {
                e.dstate.assert(DstateFlags::NEED_SYNC);
            }
        }
    }

    /// `GICD_IPRIORITYR` decomposition. Raising priority (numerically
    /// lowering it) on a currently-listed VIRQ forces a sync so the
    /// LR's stored priority gets rewritten (spec §4.4.5).
    pub fn set_priority(&self, virq: u32, priority: u8) {
        if let Some(e) = self.entry(virq) {
            let (flags, old_priority) = e.dstate.load();
            e.dstate.set_priority(priority);
            if flags.contains(DstateFlags::LISTED) && priority < old_priority {
                e.dstate.assert(DstateFlags::NEED_SYNC);
            }
        }
    }

    pub fn set_cfg_edge(&self, virq: u32, edge: bool) {
        if let Some(e) = self.entry(virq) {
            if edge {
                e.dstate.assert(DstateFlags::CFG_EDGE);
            } else {
                e.dstate.clear(DstateFlags::CFG_EDGE);
            }
        }
    }

    /// `vgic_bind_hwirq_spi`.
    pub fn bind_hwirq_spi(&self, virq: u32, pintid: u32) {
        if let Some(e) = self.entry(virq) {
            *e.hwirq.lock() = HwBinding::Shared(Arc::new(HwIrq::new(pintid, HwIrqAction::VgicForwardSpi, virq)));
        }
    }

    /// `vgic_unbind_hwirq_spi`.
    pub fn unbind_hwirq_spi(&self, virq: u32) {
        self.clear_hwirq(virq);
    }

    /// `vgic_bind_hwirq_forward_private`: one hw-irq source per pCPU,
    /// forwarding a physical PPI into VIRQ `virq` on whichever VCPU is
    /// currently affine to this pCPU (in this build, VCPU id == pCPU
    /// id, so slot `i` forwards to the VCPU affine to pCPU `i`).
    pub fn bind_hwirq_forward_private(&self, virq: u32, pintid: u32) {
        if let Some(e) = self.entry(virq) {
            let mut table = Vec::with_capacity(self.wakers.len());
            for _ in 0..self.wakers.len() {
                table.push(Some(Arc::new(HwIrq::new(pintid, HwIrqAction::VgicForwardPrivate, virq))));
            }
            *e.hwirq.lock() = HwBinding::PerCpu(table.into_boxed_slice());
        }
    }

    pub fn unbind_hwirq_forward_private(&self, virq: u32) {
        self.clear_hwirq(virq);
    }

    fn clear_hwirq(&self, virq: u32) {
        if let Some(e) = self.entry(virq) {
            *e.hwirq.lock() = HwBinding::None;
        }
    }

    pub fn gicd(&self) -> &SpinLock<VirtualGicd> {
        &self.gicd
    }

    // ── GICR WAKER (spec §4.4.5) ─────────────────────────────────────

    pub fn waker_state(&self, pcpu: u32) -> WakerState {
        self.waker(pcpu).state()
    }

    /// Guest set `GICR_WAKER.ProcessorSleep`: start draining.
    pub fn request_sleep(&self, pcpu: u32) {
        self.waker(pcpu).request_sleep();
    }

    /// Caller (the one holding `pcpu`'s `LrShadow`) has observed every
    /// LR has delisted; report `ChildrenAsleep`.
    pub fn confirm_asleep(&self, pcpu: u32, shadow: &LrShadow) {
        if shadow.iter_occupied().next().is_none() {
            self.waker(pcpu).confirm_asleep();
        }
    }

    /// Guest cleared `GICR_WAKER.ProcessorSleep`. Unblocks delivery and
    /// runs `find_pending_and_list` if the pCPU was actually asleep.
    pub fn clear_sleep(&self, pcpu: u32, target: &mut LrShadow, elrsr: u32) {
        if self.waker(pcpu).clear_sleep() {
            self.find_pending_and_list(pcpu, target, elrsr);
        }
    }

    /// Sweep every VIRQ routed to `pcpu` that is enabled, pending, and
    /// not already listed, attempting delivery into `target`. Used both
    /// after a WAKER clear and on VCPU context switch-in (spec §4.4.7).
    pub fn find_pending_and_list(&self, pcpu: u32, target: &mut LrShadow, elrsr: u32) {
        for (virq, e) in self.virqs.iter().enumerate() {
            if e.route.load(Ordering::Acquire) != pcpu {
                continue;
            }
            let flags = e.dstate.flags();
            if !flags.contains(DstateFlags::ENABLED) || flags.contains(DstateFlags::LISTED) || !Dstate::pending(flags) {
                continue;
            }
            self.virq_assert(virq as u32, target, elrsr, false, pcpu);
        }
    }

    // ── SGI generation (spec §4.4.6) ─────────────────────────────────

    /// Decode a trapped `ICC_SGI1R_EL1` write from `current_vcpu` and
    /// raise it on every targeted sibling's pending-SGI bitmap. Returns
    /// the bitmap of VCPU ids newly marked, so the caller knows who to
    /// IPI/kick out of WFI.
    pub fn generate_sgi(&self, raw: u64, current_vcpu: u32) -> u64 {
        let write = super::sgi::decode(raw);
        let online = self.attached_vcpus.load(Ordering::Acquire);
        let online_mask = if online >= 64 { u64::MAX } else { (1u64 << online) - 1 };
        self.sgis.generate(&write, current_vcpu as usize, online_mask)
    }

    /// Drain `vcpu`'s pending-SGI bitmap. Each set bit is an SGI intid
    /// ready to be listed (the caller, typically on VCPU entry or a
    /// targeted IPI, runs `virq_assert` for each one).
    pub fn take_pending_sgis(&self, vcpu: u32) -> u16 {
        self.sgis.take(vcpu as usize)
    }

    pub fn has_pending_sgis(&self, vcpu: u32) -> bool {
        self.sgis.pending(vcpu as usize)
    }
}
