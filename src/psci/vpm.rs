//! VPM (virtual power management) groups: PSCI suspend-state
//! aggregation across the VCPUs of a cluster, spec §4.5.
//!
//! Grounded on the teacher's `scheduler::Scheduler` (round-robin
//! run-state tracking per VCPU slot) generalized from "is this VCPU
//! runnable" to "does this VCPU currently vote to keep its pCPU
//! awake", plus the aggregation policy the spec adds on top.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::{MAX_SMP_CPUS, MAX_VCPUS};
use crate::error::{HvError, HvResult};

/// Per-VCPU power-management mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpmMode {
    None,
    Idle,
    Psci,
}

/// Reasons a VCPU does not currently vote to keep its pCPU awake.
/// `psci_inactive_count` is the popcount of whichever of these apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InactiveReason {
    VcpuOff = 1 << 0,
    VcpuSuspend = 1 << 1,
    VcpuWfi = 1 << 2,
    NoValidAffinity = 1 << 3,
}

/// Per-VCPU PSCI/VPM bookkeeping, embedded in the owning `Vcpu`.
pub struct VpmVcpuState {
    mode: VpmMode,
    psci_suspend_state: u32,
    inactive_mask: AtomicU32,
    pcpu: AtomicU32,
}

impl VpmVcpuState {
    pub const fn new(pcpu: u32) -> Self {
        Self {
            mode: VpmMode::None,
            psci_suspend_state: 0,
            // A freshly created VCPU has not yet been scheduled on
            // anything, so it starts counted as inactive for every
            // reason until `vcpu_poweron` clears them.
            inactive_mask: AtomicU32::new(
                InactiveReason::VcpuOff as u32
                    | InactiveReason::VcpuSuspend as u32
                    | InactiveReason::VcpuWfi as u32,
            ),
            pcpu: AtomicU32::new(pcpu),
        }
    }

    pub fn mode(&self) -> VpmMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: VpmMode) {
        self.mode = mode;
    }

    pub fn suspend_state(&self) -> u32 {
        self.psci_suspend_state
    }

    pub fn set_suspend_state(&mut self, state: u32) {
        self.psci_suspend_state = state;
    }

    pub fn inactive_count(&self) -> u32 {
        self.inactive_mask.load(Ordering::Acquire).count_ones()
    }

    pub fn is_active(&self) -> bool {
        self.inactive_mask.load(Ordering::Acquire) == 0
    }

    pub fn pcpu(&self) -> u32 {
        self.pcpu.load(Ordering::Acquire)
    }

    pub fn migrate_to(&self, pcpu: u32) {
        self.pcpu.store(pcpu, Ordering::Release);
    }

    /// Returns `(was_active, now_active)` so the caller can tell
    /// whether this reason transitioned the VCPU across the
    /// active/inactive boundary and needs to call [`VpmTracker::get`]
    /// / [`VpmTracker::put`].
    fn set_reason(&self, reason: InactiveReason, set: bool) -> (bool, bool) {
        let was_active = self.is_active();
        let bit = reason as u32;
        if set {
            self.inactive_mask.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.inactive_mask.fetch_and(!bit, Ordering::AcqRel);
        }
        (was_active, self.is_active())
    }
}

/// Global pCPU-side half of VPM get/put: one atomic counter per pCPU
/// plus a bitmap of which pCPUs currently have at least one active
/// VCPU.
pub struct VpmTracker {
    active_vcpus: [AtomicU32; MAX_SMP_CPUS],
    active_pcpu_bitmap: AtomicU64,
}

impl VpmTracker {
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            active_vcpus: [ZERO; MAX_SMP_CPUS],
            active_pcpu_bitmap: AtomicU64::new(0),
        }
    }

    /// A VCPU on `pcpu` transitioned inactive -> active.
    pub fn get(&self, pcpu: u32) {
        let idx = pcpu as usize;
        if idx >= MAX_SMP_CPUS {
            return;
        }
        let prev = self.active_vcpus[idx].fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            self.active_pcpu_bitmap.fetch_or(1 << idx, Ordering::AcqRel);
        }
    }

    /// A VCPU on `pcpu` transitioned active -> inactive.
    pub fn put(&self, pcpu: u32) {
        let idx = pcpu as usize;
        if idx >= MAX_SMP_CPUS {
            return;
        }
        let prev = self.active_vcpus[idx].fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.active_pcpu_bitmap.fetch_and(!(1 << idx), Ordering::AcqRel);
        }
    }

    /// Apply a reason transition for a VCPU, calling get/put as needed.
    pub fn apply(&self, vcpu: &VpmVcpuState, reason: InactiveReason, set: bool) {
        let (was_active, now_active) = vcpu.set_reason(reason, set);
        if was_active && !now_active {
            self.put(vcpu.pcpu());
        } else if !was_active && now_active {
            self.get(vcpu.pcpu());
        }
    }

    pub fn pcpu_has_active_vcpu(&self, pcpu: u32) -> bool {
        let idx = pcpu as usize;
        idx < MAX_SMP_CPUS && self.active_vcpus[idx].load(Ordering::Acquire) > 0
    }

    pub fn any_pcpu_active(&self) -> u64 {
        self.active_pcpu_bitmap.load(Ordering::Acquire)
    }
}

impl Default for VpmTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregation policy a VPM group uses to decide what cluster-level
/// state PSCI_CPU_SUSPEND may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpmPolicy {
    /// Platform-coordinated: the engine itself picks the shallowest
    /// requested state across affine VCPUs when the pCPU goes idle.
    Pc,
    /// OS-initiated: the guest names an explicit cluster state and the
    /// engine only validates it against siblings.
    Osi,
}

/// A set of VCPUs that aggregate PSCI suspend decisions (spec §3's
/// "VPM group"). Membership is tracked by VCPU index into a fixed
/// table rather than the original's atomic pointers, since nothing
/// here needs a VCPU's address, only its VPM state.
pub struct VpmGroup {
    pub policy: VpmPolicy,
    members: [Option<u32>; MAX_VCPUS],
    online_count: AtomicU32,
    /// Bitmap of member indices currently recorded as suspended at or
    /// above some cluster-relevant level; consulted by OSI validation.
    suspended_mask: AtomicU64,
}

impl VpmGroup {
    pub const fn new(policy: VpmPolicy) -> Self {
        Self {
            policy,
            members: [None; MAX_VCPUS],
            online_count: AtomicU32::new(0),
            suspended_mask: AtomicU64::new(0),
        }
    }

    /// `vpm_attach`.
    pub fn attach(&mut self, slot: usize, vcpu_id: u32) -> HvResult<()> {
        if slot >= MAX_VCPUS {
            return Err(HvError::ArgumentInvalid);
        }
        if self.members[slot].is_some() {
            return Err(HvError::ObjectState);
        }
        self.members[slot] = Some(vcpu_id);
        self.online_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn member(&self, slot: usize) -> Option<u32> {
        self.members.get(slot).copied().flatten()
    }

    /// Find a member by MPIDR-derived id via linear scan, as
    /// `PSCI_CPU_ON` does (spec §4.5).
    pub fn find_member(&self, vcpu_id: u32) -> Option<usize> {
        self.members.iter().position(|m| *m == Some(vcpu_id))
    }

    pub fn mark_suspended(&self, slot: usize, suspended: bool) {
        if slot >= 64 {
            return;
        }
        if suspended {
            self.suspended_mask.fetch_or(1 << slot, Ordering::AcqRel);
        } else {
            self.suspended_mask.fetch_and(!(1 << slot), Ordering::AcqRel);
        }
    }

    /// OS-initiated validation: deny a cluster-level suspend request
    /// if any sibling slot (other than `requesting_slot`) is still
    /// awake, per spec §4.5's OSI aggregation rule.
    pub fn validate_osi_cluster_suspend(&self, requesting_slot: usize) -> HvResult<()> {
        let mask = self.suspended_mask.load(Ordering::Acquire);
        for slot in 0..MAX_VCPUS.min(64) {
            if slot == requesting_slot {
                continue;
            }
            if self.members[slot].is_some() && mask & (1 << slot) == 0 {
                return Err(HvError::Denied);
            }
        }
        Ok(())
    }

    /// Platform-coordinated aggregation: shallowest (numerically
    /// smallest) requested state across currently-suspended members,
    /// or `None` if nobody has requested anything.
    pub fn shallowest_requested(&self, requested: &[Option<u32>]) -> Option<u32> {
        requested.iter().flatten().copied().min()
    }

    pub fn last_vcpu_suspended(&self) -> bool {
        let mask = self.suspended_mask.load(Ordering::Acquire);
        let online = self.online_count.load(Ordering::Acquire);
        mask.count_ones() == online && online > 0
    }
}
