//! Two-stage page-table engine.
//!
//! [`hyp`] owns the hypervisor's own stage-1 mappings; [`vm`] owns one
//! stage-2 table per VM. Both share the generic [`walker`], which walks
//! a table tree applying a [`walker::WalkOp`] (map/remap/unmap/
//! unmap-matching/preallocate) over a virtual or intermediate-physical
//! address range, splitting and coalescing block mappings as needed and
//! issuing TLB maintenance ([`tlb`]) around every break-before-make
//! step. Generalizes the teacher's `arch::aarch64::mm::mmu` (a
//! single fixed-layout stage-2 identity map) to the full external
//! interface named in spec §4.3/§6.

pub mod entry;
pub mod hyp;
pub mod tlb;
pub mod vm;
pub mod walker;

pub use entry::Attrs;
pub use hyp::PgtableHyp;
pub use vm::PgtableVm;
pub use walker::LookupResult;
