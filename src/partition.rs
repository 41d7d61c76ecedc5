//! Partition: a named container of physical resources (spec §3).
//!
//! Generalizes the teacher's single global [`mm::allocator::Allocator`]
//! heap into one allocator per partition, each registering the memory
//! it owns with the system-wide [`mm::memdb::Memdb`] so ownership of
//! any physical range can be queried independent of which partition
//! handed it out. `partition_phys_{map,unmap,access_enable,
//! access_disable}` are the one exception to this build's otherwise
//! identity-mapped hyp address space: they borrow a scratch window of
//! the hyp page table for mapping physical pages that aren't part of
//! the permanent identity range.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HvError, HvResult};
use crate::mm::memdb::{Memdb, ObjectType, OwnerId};
use crate::mm::pgtable::{Attrs, PgtableHyp};
use crate::mm::Allocator;
use crate::platform::{PARTITION_PHYS_WINDOW_BASE, PARTITION_PHYS_WINDOW_SIZE};
use crate::sync::SpinLock;

/// Partition lifecycle, spec §3's "Lifecycles" section: `INIT` before
/// any memory has been donated, `ACTIVE` once it owns at least one
/// range, destroyed only once emptied back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Init,
    Active,
    Destroyed,
}

pub struct Partition {
    id: OwnerId,
    state: SpinLock<PartitionState>,
    allocator: Allocator,
}

impl Partition {
    pub fn new(id: OwnerId) -> Self {
        Self {
            id,
            state: SpinLock::new(PartitionState::Init),
            allocator: Allocator::default(),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn state(&self) -> PartitionState {
        *self.state.lock()
    }

    /// Donate a physical range to this partition's allocator and record
    /// it in the ownership database. Transitions `INIT -> ACTIVE`.
    pub fn add_memory(&self, memdb: &Memdb, addr: u64, size: u64) -> HvResult<()> {
        memdb.insert(addr, addr + size, self.id, ObjectType::Partition)?;
        self.allocator.add_memory(addr, size)?;
        let mut state = self.state.lock();
        if *state == PartitionState::Init {
            *state = PartitionState::Active;
        }
        Ok(())
    }

    /// `partition_alloc`: returns `(phys, virt)`. This build's hyp
    /// address space is identity-mapped over the donated RAM range, so
    /// `virt == phys`; callers that need the pair kept separate (spec's
    /// signature) still get it for API parity with a build that isn't.
    pub fn partition_alloc(&self, size: u64, align: u64) -> HvResult<(u64, u64)> {
        let phys = self.allocator.allocate(size, align)?;
        Ok((phys, phys))
    }

    /// `partition_free`.
    pub fn partition_free(&self, phys: u64, size: u64) -> HvResult<()> {
        self.allocator.deallocate(phys, size)
    }

    /// `partition_virt_to_phys`: identity in this build outside the
    /// scratch phys-map window, where the window tracks its own
    /// mapping table.
    pub fn partition_virt_to_phys(&self, virt: u64) -> HvResult<u64> {
        if virt >= PARTITION_PHYS_WINDOW_BASE && virt < PARTITION_PHYS_WINDOW_BASE + PARTITION_PHYS_WINDOW_SIZE {
            return Err(HvError::ArgumentInvalid);
        }
        Ok(virt)
    }

    pub fn is_destroyed(&self) -> bool {
        *self.state.lock() == PartitionState::Destroyed
    }

    /// Destroy an empty partition. Spec: destruction is only valid once
    /// every range it owns has been returned.
    pub fn destroy(&self) -> HvResult<()> {
        if self.allocator.alloc_size() != 0 {
            return Err(HvError::AllocatorMemInUse);
        }
        *self.state.lock() = PartitionState::Destroyed;
        Ok(())
    }
}

/// Scratch window allocator for `partition_phys_{map,unmap}`: a bump
/// cursor over one fixed virtual range of the hyp page table. Freed
/// slots are not reclaimed individually (mirrors the teacher's simple
/// bump-allocator heap before the coalescing allocator replaced it);
/// the window is sized generously enough that steady-state map/unmap
/// churn doesn't exhaust it in a single boot.
pub struct PhysMapWindow {
    next: AtomicU64,
}

impl PhysMapWindow {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(PARTITION_PHYS_WINDOW_BASE),
        }
    }

    /// `partition_phys_map`: map `size` bytes of `phys` into the window,
    /// read-write, and return the virtual address.
    pub fn phys_map(&self, hyp: &PgtableHyp, phys: u64, size: u64) -> HvResult<u64> {
        let vaddr = self.next.fetch_add(size, Ordering::AcqRel);
        if vaddr + size > PARTITION_PHYS_WINDOW_BASE + PARTITION_PHYS_WINDOW_SIZE {
            return Err(HvError::NoMem);
        }
        let mut txn = hyp.start();
        txn.map(vaddr, size, phys, Attrs::AF | Attrs::SH_INNER | Attrs::AP_RW | Attrs::MEMTYPE_NORMAL)?;
        txn.commit();
        Ok(vaddr)
    }

    /// `partition_phys_unmap`.
    pub fn phys_unmap(&self, hyp: &PgtableHyp, vaddr: u64, size: u64) -> HvResult<()> {
        let mut txn = hyp.start();
        txn.unmap(vaddr, size)?;
        txn.commit();
        Ok(())
    }

    /// `partition_phys_access_enable`: restore read-write access to a
    /// previously mapped window without tearing it down and rebuilding
    /// the page-table entries from scratch.
    pub fn access_enable(&self, hyp: &PgtableHyp, vaddr: u64, size: u64, phys: u64) -> HvResult<()> {
        let mut txn = hyp.start();
        txn.remap(vaddr, size, phys, Attrs::AF | Attrs::SH_INNER | Attrs::AP_RW | Attrs::MEMTYPE_NORMAL)?;
        txn.commit();
        Ok(())
    }

    /// `partition_phys_access_disable`: drop to read-only, used while a
    /// page is being inspected or migrated and must not be mutated
    /// through this mapping.
    pub fn access_disable(&self, hyp: &PgtableHyp, vaddr: u64, size: u64, phys: u64) -> HvResult<()> {
        let mut txn = hyp.start();
        txn.remap(vaddr, size, phys, Attrs::AF | Attrs::SH_INNER | Attrs::AP_RO | Attrs::MEMTYPE_NORMAL)?;
        txn.commit();
        Ok(())
    }
}

impl Default for PhysMapWindow {
    fn default() -> Self {
        Self::new()
    }
}
