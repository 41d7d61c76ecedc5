//! Guest (stage-2, IPA) page tables.
//!
//! One instance per VM. Generalizes the teacher's `Stage2Config` +
//! `DynamicIdentityMapper` (which built a single fixed stage-2 table at
//! boot) into a per-VM table the VM's owning partition can incrementally
//! map/unmap extents into over the VM's lifetime, per spec §4.3's
//! `pgtable_vm_*` interface.

use alloc::boxed::Box;

use crate::error::HvResult;
use crate::sync::{SpinLock, SpinLockGuard};

use super::entry::{Attrs, Level};
use super::tlb;
use super::walker::{self, LookupResult, WalkOp};

// Mirrors `arch::aarch64::defs`'s VTCR_* bits; kept local (rather than
// importing that aarch64-only module) so this file builds for host
// unit tests on non-aarch64 targets too.
const VTCR_T0SZ_48BIT: u64 = 16;
const VTCR_SL0_LEVEL0: u64 = 2 << 6;
const VTCR_IRGN0_WB: u64 = 0b01 << 8;
const VTCR_ORGN0_WB: u64 = 0b01 << 10;
const VTCR_SH0_INNER: u64 = 0b11 << 12;
const VTCR_TG0_4KB: u64 = 0b00 << 14;
const VTCR_PS_48BIT: u64 = 0b101 << 16;

const VTCR_FIXED: u64 = VTCR_T0SZ_48BIT
    | VTCR_SL0_LEVEL0
    | VTCR_IRGN0_WB
    | VTCR_ORGN0_WB
    | VTCR_SH0_INNER
    | VTCR_TG0_4KB
    | VTCR_PS_48BIT;

pub struct PgtableVm {
    vmid: u16,
    root: SpinLock<Box<Level>>,
}

impl PgtableVm {
    /// `vm_init`: allocate an empty stage-2 table for a freshly created
    /// VM identified by `vmid` (the VMID field of its future VTTBR).
    pub fn vm_init(vmid: u16) -> Self {
        Self {
            vmid,
            root: SpinLock::new(Level::zeroed()),
        }
    }

    /// `vm_destroy`: unmap everything and free every table level. The
    /// root itself is dropped with `self`; this just ensures no stale
    /// TLB entries for the VMID survive reuse.
    pub fn vm_destroy(self) {
        tlb::invalidate_vm_all();
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    /// VTCR_EL2 value to install while this VM is scheduled, shared by
    /// every VM (the teacher's `Stage2Config` computed the identical
    /// value once at boot; it does not vary per-VM).
    pub fn vtcr(&self) -> u64 {
        VTCR_FIXED
    }

    /// VTTBR_EL2 value to install while this VM is scheduled: the root
    /// table's physical address with the VMID field packed into
    /// bits[63:48].
    pub fn vttbr(&self) -> u64 {
        let root_addr = {
            let guard = self.root.lock();
            &*guard as *const Level as u64
        };
        ((self.vmid as u64) << 48) | (root_addr & 0x0000_FFFF_FFFF_F000)
    }

    pub fn start(&self) -> VmTxn<'_> {
        VmTxn {
            vmid: self.vmid,
            guard: self.root.lock(),
        }
    }

    pub fn lookup(&self, ipa: u64) -> Option<LookupResult> {
        walker::lookup(&self.root.lock(), ipa)
    }

    /// `vm_load_regs`: program VTCR_EL2/VTTBR_EL2 for this VM before
    /// entering one of its vcpus.
    #[cfg(target_arch = "aarch64")]
    pub fn load_regs(&self) {
        let vttbr = self.vttbr();
        let vtcr = self.vtcr();
        unsafe {
            core::arch::asm!("msr vtcr_el2, {0}", in(reg) vtcr, options(nostack));
            core::arch::asm!("msr vttbr_el2, {0}", in(reg) vttbr, options(nostack));
            core::arch::asm!("isb", options(nostack));
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    pub fn load_regs(&self) {}
}

pub struct VmTxn<'a> {
    vmid: u16,
    guard: SpinLockGuard<'a, Box<Level>>,
}

impl<'a> VmTxn<'a> {
    pub fn map(&mut self, ipa: u64, size: u64, phys: u64, attrs: Attrs) -> HvResult<()> {
        walker::walk_apply(
            &mut self.guard,
            ipa,
            ipa + size,
            &WalkOp::Map {
                phys_base: phys,
                attrs,
            },
        )
    }

    pub fn unmap(&mut self, ipa: u64, size: u64) -> HvResult<()> {
        walker::walk_apply(&mut self.guard, ipa, ipa + size, &WalkOp::Unmap)
    }

    /// `vm_unmap_matching`: tear down only the mappings in `[ipa, ipa+size)`
    /// that still point at `phys` + offset, leaving any mapping a
    /// concurrent operation retargeted elsewhere untouched (spec's
    /// "matching" unmap modifier).
    pub fn unmap_matching(&mut self, ipa: u64, size: u64, phys: u64) -> HvResult<()> {
        walker::walk_apply(
            &mut self.guard,
            ipa,
            ipa + size,
            &WalkOp::UnmapMatching { phys_base: phys },
        )
    }

    pub fn preallocate(&mut self, ipa: u64, size: u64) -> HvResult<()> {
        walker::walk_apply(&mut self.guard, ipa, ipa + size, &WalkOp::Preallocate)
    }

    pub fn lookup(&self, ipa: u64) -> Option<LookupResult> {
        walker::lookup(&self.guard, ipa)
    }

    /// End the batch. Stage-2 invalidation is VMID-scoped, so this
    /// swaps VTTBR to the owning VM for the duration of the flush and
    /// restores whatever was scheduled before, per spec's TLB
    /// maintenance ordering requirement for off-context pgtable edits.
    pub fn commit(self) {
        let vttbr = (self.vmid as u64) << 48;
        tlb::with_vttbr(vttbr, tlb::invalidate_vm_all);
    }
}
