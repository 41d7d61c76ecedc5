//! Per-VIRQ delivery state: an atomic bitfield plus the CAS helpers
//! [`deliver`]/[`vic`] build on. Mirrors the teacher's
//! `VirtualInterruptState` (a single HCR_EL2.VI-bit flag) generalized to
//! the full per-VIRQ state word a GICv3 list-register scheme needs.

use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DstateFlags: u32 {
        const ENABLED     = 1 << 0;
        const GROUP1      = 1 << 1;
        const CFG_EDGE    = 1 << 2;
        const EDGE        = 1 << 3; // pending-edge latch
        const LEVEL_SW    = 1 << 4; // pending-level, software source
        const LEVEL_MSG   = 1 << 5; // pending-level, doorbell/message source
        const LEVEL_SRC   = 1 << 6; // pending-level, hardware source
        const ACTIVE      = 1 << 7;
        const LISTED      = 1 << 8;
        const NEED_SYNC   = 1 << 9;
        const HW_DETACHED = 1 << 10;
    }
}

const PRIORITY_SHIFT: u32 = 24;
const PRIORITY_MASK: u32 = 0xFF << PRIORITY_SHIFT;

/// Atomic delivery state word for one VIRQ. Priority is packed into the
/// top byte so a single CAS covers both the flag bits and the priority
/// a concurrent `GICD_IPRIORITYR` write might be changing.
pub struct Dstate(AtomicU32);

impl Dstate {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn load(&self) -> (DstateFlags, u8) {
        let raw = self.0.load(Ordering::Acquire);
        (DstateFlags::from_bits_truncate(raw & !PRIORITY_MASK), (raw >> PRIORITY_SHIFT) as u8)
    }

    pub fn flags(&self) -> DstateFlags {
        self.load().0
    }

    pub fn priority(&self) -> u8 {
        self.load().1
    }

    pub fn pending(flags: DstateFlags) -> bool {
        flags.intersects(DstateFlags::EDGE | DstateFlags::LEVEL_SW | DstateFlags::LEVEL_MSG | DstateFlags::LEVEL_SRC)
    }

    /// `assert_flags` OR'd into the state word. Returns the state word
    /// observed *before* the OR, so the caller can tell whether the
    /// VIRQ was already listed (step 1 of deliver()).
    pub fn assert(&self, assert_flags: DstateFlags) -> (DstateFlags, u8) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let new = cur | assert_flags.bits();
            match self.0.compare_exchange_weak(cur, new, Ordering::Release, Ordering::Acquire) {
                Ok(prev) => {
                    return (DstateFlags::from_bits_truncate(prev & !PRIORITY_MASK), (prev >> PRIORITY_SHIFT) as u8)
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Clear `clear_flags`, returning the state word observed before
    /// the clear.
    pub fn clear(&self, clear_flags: DstateFlags) -> (DstateFlags, u8) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let new = cur & !clear_flags.bits();
            match self.0.compare_exchange_weak(cur, new, Ordering::Release, Ordering::Acquire) {
                Ok(prev) => {
                    return (DstateFlags::from_bits_truncate(prev & !PRIORITY_MASK), (prev >> PRIORITY_SHIFT) as u8)
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Unconditionally replace flags, preserving the current priority.
    pub fn set_flags(&self, flags: DstateFlags) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let new = (cur & PRIORITY_MASK) | flags.bits();
            match self.0.compare_exchange_weak(cur, new, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn set_priority(&self, priority: u8) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let new = (cur & !PRIORITY_MASK) | ((priority as u32) << PRIORITY_SHIFT);
            match self.0.compare_exchange_weak(cur, new, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for Dstate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_then_pending() {
        let d = Dstate::new();
        d.set_flags(DstateFlags::ENABLED | DstateFlags::CFG_EDGE);
        let (prev, _) = d.assert(DstateFlags::EDGE);
        assert!(!prev.contains(DstateFlags::EDGE));
        assert!(Dstate::pending(d.flags()));
    }

    #[test]
    fn double_assert_is_idempotent() {
        let d = Dstate::new();
        d.set_flags(DstateFlags::ENABLED | DstateFlags::CFG_EDGE);
        d.assert(DstateFlags::EDGE);
        let (prev, _) = d.assert(DstateFlags::EDGE);
        assert!(prev.contains(DstateFlags::EDGE));
        assert!(d.flags().contains(DstateFlags::EDGE));
    }

    #[test]
    fn clear_removes_pending_bits() {
        let d = Dstate::new();
        d.assert(DstateFlags::EDGE | DstateFlags::LEVEL_SW);
        d.clear(DstateFlags::EDGE);
        assert!(d.flags().contains(DstateFlags::LEVEL_SW));
        assert!(!d.flags().contains(DstateFlags::EDGE));
    }

    #[test]
    fn priority_survives_flag_changes() {
        let d = Dstate::new();
        d.set_priority(0x40);
        d.assert(DstateFlags::EDGE);
        assert_eq!(d.priority(), 0x40);
    }
}
