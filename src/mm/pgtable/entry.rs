//! Page-table descriptor bit layout.
//!
//! Generalizes the teacher's `S2PageTableEntry`/`MemoryAttributes` (which
//! only modeled stage-2 blocks/tables) to a descriptor shared by both
//! translation stages, plus a refcount packed into bits [63:55], which
//! VMSAv8 leaves software-defined/ignored on every descriptor kind this
//! crate builds.

use bitflags::bitflags;

const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
// Bits [63:55] are ignored by the architecture on both table and block/
// page descriptors, clear of every attr bit this crate uses (XN@54,
// Contiguous@52), so the refcount can live there without aliasing a
// real descriptor field.
const REFCOUNT_SHIFT: u32 = 55;
const REFCOUNT_MASK: u64 = 0x1FF << REFCOUNT_SHIFT; // 9 bits: 0..=511

bitflags! {
    /// Memory type / access / shareability lower attrs, plus upper attrs
    /// (execute-never, contiguous bit). Stage-1 AP bits and stage-2 S2AP
    /// bits share the same encoding for read-only vs read-write, which is
    /// the only access distinction this crate's callers need.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Attrs: u64 {
        const AF          = 1 << 10; // access flag
        const SH_INNER    = 0b11 << 8;
        const AP_RO       = 0b01 << 6; // stage-1 AP[2]=1 / stage-2 S2AP read-only
        const AP_RW       = 0b11 << 6;
        const XN          = 1 << 54; // execute-never (upper attr)
        const CONTIGUOUS  = 1 << 52; // contiguous bit (upper attr)
        const MEMTYPE_DEVICE = 0b0000 << 2;
        const MEMTYPE_NORMAL = 0b1111 << 2;
    }
}

impl Attrs {
    pub fn memtype_mask() -> Attrs {
        Attrs::MEMTYPE_DEVICE | Attrs::MEMTYPE_NORMAL
    }

    pub fn access_mask() -> Attrs {
        Attrs::AP_RO | Attrs::AP_RW
    }

    /// Do these attrs differ from `other` only in access-permission bits
    /// (and XN), letting the walker apply the change without BBM?
    pub fn differs_only_in_access(self, other: Attrs) -> bool {
        let strip = Attrs::access_mask() | Attrs::XN;
        (self - strip) == (other - strip)
    }
}

/// One 64-bit descriptor slot of a page-table level.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const fn invalid() -> Self {
        Self(0)
    }

    pub fn table(next_level_addr: u64, refcount: u32) -> Self {
        let refcount = refcount.min(511);
        Self((next_level_addr & ADDR_MASK) | 0b11 | ((refcount as u64) << REFCOUNT_SHIFT))
    }

    pub fn block(addr: u64, attrs: Attrs) -> Self {
        Self((addr & ADDR_MASK) | 0b01 | attrs.bits())
    }

    pub fn page(addr: u64, attrs: Attrs) -> Self {
        Self((addr & ADDR_MASK) | 0b11 | (attrs.bits() & !0b11))
    }

    pub fn is_valid(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// A table descriptor has bit[1] set at a non-leaf level; a block
    /// descriptor has bit[1] clear. Leaf-level page descriptors also set
    /// bit[1], distinguished from table descriptors only by which level
    /// they live at (the walker knows whether it is at the last level).
    pub fn is_table_bit_set(self) -> bool {
        self.0 & 0b10 != 0
    }

    pub fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn attrs(self) -> Attrs {
        Attrs::from_bits_truncate(self.0 & !ADDR_MASK & !REFCOUNT_MASK & !0b11)
    }

    pub fn refcount(self) -> u32 {
        ((self.0 & REFCOUNT_MASK) >> REFCOUNT_SHIFT) as u32
    }

    pub fn with_refcount(self, refcount: u32) -> Self {
        let refcount = refcount.min(511);
        Self((self.0 & !REFCOUNT_MASK) | ((refcount as u64) << REFCOUNT_SHIFT))
    }

    pub fn with_attrs(self, attrs: Attrs) -> Self {
        Self((self.0 & (ADDR_MASK | 0b11)) | attrs.bits())
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// One page-sized level: a fixed fan-out array of descriptors.
#[repr(C, align(4096))]
pub struct Level {
    pub descriptors: [Descriptor; 512],
}

impl Level {
    pub fn zeroed() -> alloc::boxed::Box<Level> {
        alloc::boxed::Box::new(Level {
            descriptors: [Descriptor::invalid(); 512],
        })
    }
}
