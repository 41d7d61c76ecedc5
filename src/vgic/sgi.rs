//! SGI generation (spec §4.4.6): decoding an `ICC_SGIR1_EL1` write into
//! a per-VCPU pending-SGI bitmap. An SGI is routed by `(Aff, TargetList)`
//! directly rather than through the shared `route` field the rest of
//! [`super::vic::Vic`] uses for SPIs/PPIs, so it gets its own small
//! bitmap instead of riding the per-VIRQ `dstate` table. Bit layout
//! mirrors the trapped-write decode already used by
//! `arch::aarch64::hypervisor::exception::handle_sgi_trap`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::platform::MAX_SMP_CPUS;

/// Decoded `ICC_SGI1R_EL1` write: `IRM` (bit 40), `INTID` (bits
/// [27:24]), `TargetList` (bits [15:0], bit N = Aff0 == N).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgiWrite {
    pub intid: u32,
    pub irm_all: bool,
    pub target_list: u16,
}

pub fn decode(value: u64) -> SgiWrite {
    SgiWrite {
        intid: ((value >> 24) & 0xF) as u32,
        irm_all: (value >> 40) & 1 != 0,
        target_list: (value & 0xFFFF) as u16,
    }
}

/// Per-VCPU pending-SGI bitmap: bit N of slot V means SGI N is pending
/// delivery to VCPU V.
pub struct PendingSgis(Box<[AtomicU16]>);

impl PendingSgis {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_SMP_CPUS);
        for _ in 0..MAX_SMP_CPUS {
            slots.push(AtomicU16::new(0));
        }
        Self(slots.into_boxed_slice())
    }

    /// Take and clear the pending bitmap for `vcpu` (drained on VCPU
    /// entry, one SGI per set bit gets listed).
    pub fn take(&self, vcpu: usize) -> u16 {
        self.0.get(vcpu).map(|a| a.swap(0, Ordering::Acquire)).unwrap_or(0)
    }

    pub fn pending(&self, vcpu: usize) -> bool {
        self.0.get(vcpu).map(|a| a.load(Ordering::Relaxed) != 0).unwrap_or(false)
    }

    fn raise(&self, vcpu: usize, intid: u32) {
        if let Some(a) = self.0.get(vcpu) {
            a.fetch_or(1 << intid, Ordering::Release);
        }
    }

    /// Apply a decoded write from `current_vcpu`, marking every
    /// targeted sibling pending. Returns a bitmap of VCPU ids that were
    /// newly marked, so the caller can IPI them (`reason=VGIC_SGI`).
    pub fn generate(&self, write: &SgiWrite, current_vcpu: usize, online_mask: u64) -> u64 {
        let mut targeted: u64 = 0;
        if write.irm_all {
            for vcpu in 0..MAX_SMP_CPUS {
                if vcpu != current_vcpu && online_mask & (1 << vcpu) != 0 {
                    self.raise(vcpu, write.intid);
                    targeted |= 1 << vcpu;
                }
            }
        } else {
            for bit in 0..MAX_SMP_CPUS {
                if write.target_list & (1 << bit) != 0 {
                    self.raise(bit, write.intid);
                    targeted |= 1 << bit;
                }
            }
        }
        targeted
    }
}

impl Default for PendingSgis {
    fn default() -> Self {
        Self::new()
    }
}
