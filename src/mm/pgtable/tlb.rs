//! TLB maintenance primitives.
//!
//! The walker calls these around every break-before-make step; on
//! target they lower to the `tlbi`/`dsb`/`isb` sequences the teacher's
//! `init_stage2` already used for its one-shot stage-2 install, here
//! split out so both stages' incremental map/unmap can share them.
//! Off-target (host unit tests) these are no-ops.

/// Break-before-make requires a full maintenance sequence after
/// invalidating a descriptor and before writing its replacement so no
/// core can still be walking the old mapping. Cheap relative to a
/// stage-2 fault, so we run it on every partial-unmap/split/overwrite
/// rather than trying to batch it across a range.
pub fn maintain_after_unmap() {
    dsb_ishst();
    isb();
}

/// Invalidate stage-1 EL2 TLB entries for `vaddr`, all inner-shareable
/// PEs (`tlbi vae2is`).
#[cfg(target_arch = "aarch64")]
pub fn invalidate_hyp_va(vaddr: u64) {
    let page = vaddr >> 12;
    unsafe {
        core::arch::asm!("tlbi vae2is, {0}", in(reg) page, options(nostack));
    }
    dsb_ish();
    isb();
}

#[cfg(not(target_arch = "aarch64"))]
pub fn invalidate_hyp_va(_vaddr: u64) {}

/// Invalidate stage-2 (IPA) TLB entries for `ipa`, all inner-shareable
/// PEs (`tlbi ipas2e1is`), followed by the required stage-1 flush
/// (`tlbi vmalle1is`) the architecture mandates after any stage-2
/// invalidation so stage-1 walks that cached the old stage-2 result
/// are also discarded.
#[cfg(target_arch = "aarch64")]
pub fn invalidate_vm_ipa(ipa: u64) {
    let page = ipa >> 12;
    unsafe {
        core::arch::asm!("tlbi ipas2e1is, {0}", in(reg) page, options(nostack));
    }
    dsb_ish();
    unsafe {
        core::arch::asm!("tlbi vmalle1is", options(nostack));
    }
    dsb_ish();
    isb();
}

#[cfg(not(target_arch = "aarch64"))]
pub fn invalidate_vm_ipa(_ipa: u64) {}

/// Flush the whole stage-2 TLB for a VM, e.g. after an unmap-matching
/// sweep touches enough entries that per-page invalidation would cost
/// more than a full flush.
#[cfg(target_arch = "aarch64")]
pub fn invalidate_vm_all() {
    unsafe {
        core::arch::asm!("tlbi vmalls12e1is", options(nostack));
    }
    dsb_ish();
    isb();
}

#[cfg(not(target_arch = "aarch64"))]
pub fn invalidate_vm_all() {}

#[cfg(target_arch = "aarch64")]
fn dsb_ish() {
    unsafe { core::arch::asm!("dsb ish", options(nostack)) };
}

#[cfg(not(target_arch = "aarch64"))]
fn dsb_ish() {}

#[cfg(target_arch = "aarch64")]
fn dsb_ishst() {
    unsafe { core::arch::asm!("dsb ishst", options(nostack)) };
}

#[cfg(not(target_arch = "aarch64"))]
fn dsb_ishst() {}

#[cfg(target_arch = "aarch64")]
fn isb() {
    unsafe { core::arch::asm!("isb", options(nostack)) };
}

#[cfg(not(target_arch = "aarch64"))]
fn isb() {}

/// Read VTTBR_EL2, run `f`, then restore it. The walker for a
/// non-current VM's stage-2 table must swap VTTBR to issue
/// VM-scoped `ipas2e1is`/`vmalle1is` invalidations against the right
/// address space and then put the previous VM's VTTBR back, exactly as
/// spec §4.3 requires for TLB maintenance issued outside that VM's own
/// scheduling context.
#[cfg(target_arch = "aarch64")]
pub fn with_vttbr<R>(vttbr: u64, f: impl FnOnce() -> R) -> R {
    let saved: u64;
    unsafe {
        core::arch::asm!("mrs {0}, vttbr_el2", out(reg) saved, options(nostack));
        core::arch::asm!("msr vttbr_el2, {0}", in(reg) vttbr, options(nostack));
        isb();
    }
    let result = f();
    unsafe {
        core::arch::asm!("msr vttbr_el2, {0}", in(reg) saved, options(nostack));
        isb();
    }
    result
}

#[cfg(not(target_arch = "aarch64"))]
pub fn with_vttbr<R>(_vttbr: u64, f: impl FnOnce() -> R) -> R {
    f()
}
