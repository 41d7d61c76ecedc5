//! Hypervisor (stage-1, EL2) page tables.
//!
//! One instance backs the hypervisor's own address space. Mirrors the
//! teacher's `IdentityMapper`, but table-driven rather than a fixed
//! L0/L1/4×L2 layout, and routed through the generic walker so it
//! supports incremental map/unmap instead of only a one-shot identity
//! map built at boot.

use alloc::boxed::Box;

use crate::error::HvResult;
use crate::sync::{SpinLock, SpinLockGuard};

use super::entry::{Attrs, Level};
use super::tlb;
use super::walker::{self, LookupResult, WalkOp};

pub struct PgtableHyp {
    root: SpinLock<Box<Level>>,
}

impl PgtableHyp {
    pub fn new() -> Self {
        Self {
            root: SpinLock::new(Level::zeroed()),
        }
    }

    /// Begin a batch of map/unmap/preallocate calls. Spec §4.3 frames
    /// every pgtable mutation inside a `pgtable_hyp_start`/`_commit`
    /// pair; here that framing is the lock guard's lifetime, with
    /// `commit` issuing the final TLB barrier.
    pub fn start(&self) -> HypTxn<'_> {
        HypTxn {
            guard: self.root.lock(),
        }
    }

    pub fn lookup(&self, vaddr: u64) -> Option<LookupResult> {
        walker::lookup(&self.root.lock(), vaddr)
    }
}

impl Default for PgtableHyp {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HypTxn<'a> {
    guard: SpinLockGuard<'a, Box<Level>>,
}

impl<'a> HypTxn<'a> {
    pub fn map(&mut self, vaddr: u64, size: u64, phys: u64, attrs: Attrs) -> HvResult<()> {
        walker::walk_apply(
            &mut self.guard,
            vaddr,
            vaddr + size,
            &WalkOp::Map {
                phys_base: phys,
                attrs,
            },
        )
    }

    pub fn remap(&mut self, vaddr: u64, size: u64, phys: u64, attrs: Attrs) -> HvResult<()> {
        walker::walk_apply(
            &mut self.guard,
            vaddr,
            vaddr + size,
            &WalkOp::Remap {
                phys_base: phys,
                attrs,
            },
        )
    }

    pub fn unmap(&mut self, vaddr: u64, size: u64) -> HvResult<()> {
        walker::walk_apply(&mut self.guard, vaddr, vaddr + size, &WalkOp::Unmap)
    }

    pub fn preallocate(&mut self, vaddr: u64, size: u64) -> HvResult<()> {
        walker::walk_apply(&mut self.guard, vaddr, vaddr + size, &WalkOp::Preallocate)
    }

    pub fn lookup(&self, vaddr: u64) -> Option<LookupResult> {
        walker::lookup(&self.guard, vaddr)
    }

    /// End the batch: one last barrier so every invalidation issued
    /// during this transaction is globally visible before the caller
    /// acts on the new mappings (e.g. branches into newly mapped code).
    pub fn commit(self) {
        tlb::maintain_after_unmap();
    }
}
