//! Direct physical-GIC register pokes the VIRQ state machine needs
//! outside of the normal trap-and-emulate path: reprogramming
//! `GICD_IROUTER` for a forwarded hw-irq on route change, and toggling
//! a forwarded PPI's physical `GICR_ISENABLER0`/`ICENABLER0` bit when
//! the guest enables/disables the virtual side (spec §4.4.5, §4.4.6).
//! Mirrors the teacher's direct-physical-register style in
//! `vm::ensure_vtimer_enabled`/`wake_gicr`. Off-target (host unit
//! tests) these are no-ops, same pattern as `mm::pgtable::tlb`.

const GICD_IROUTER_BASE: u64 = 0x6100;
const GICR_ISENABLER0_OFF: u64 = 0x100;
const GICR_ICENABLER0_OFF: u64 = 0x180;

#[cfg(target_arch = "aarch64")]
pub fn reprogram_irouter(pintid: u32, affinity: u64) {
    if pintid < 32 {
        return;
    }
    let idx = (pintid - 32) as u64;
    let addr = (crate::platform::GICD_BASE + GICD_IROUTER_BASE + idx * 8) as *mut u64;
    unsafe {
        core::ptr::write_volatile(addr, affinity);
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn reprogram_irouter(_pintid: u32, _affinity: u64) {}

#[cfg(target_arch = "aarch64")]
pub fn set_ppi_enabled(pcpu: u32, pintid: u32, enabled: bool) {
    if pintid >= 32 {
        return;
    }
    let sgi_base = crate::dtb::gicr_sgi_base(pcpu as usize);
    let off = if enabled { GICR_ISENABLER0_OFF } else { GICR_ICENABLER0_OFF };
    let addr = (sgi_base + off) as *mut u32;
    unsafe {
        core::ptr::write_volatile(addr, 1u32 << pintid);
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn set_ppi_enabled(_pcpu: u32, _pintid: u32, _enabled: bool) {}
