//! Generic VMSAv8 walker.
//!
//! A single recursive walk routine drives every external operation
//! (map/remap/unmap/preallocate/lookup): the caller supplies a
//! [`WalkOp`] describing what to do when the walk reaches a descriptor
//! that is fully contained in the requested range, and the walker
//! recurses into child tables, allocating or freeing them and
//! maintaining refcounts as it goes. This generalizes the teacher's
//! `DynamicIdentityMapper::map_region`/`get_or_create_l2` (which only
//! ever built stage-2 2MB blocks) to arbitrary levels, both
//! translation stages, and the full map/unmap/lookup op set, in the
//! spirit of the crate's stage-2 mapper and of k23's generic
//! `libs/vmm/src/mapper.rs` walker.

use alloc::boxed::Box;

use crate::error::{HvError, HvResult};

use super::entry::{Attrs, Descriptor, Level};

/// Number of levels in a 4KB-granule, 48-bit address space walk: L0..L3.
pub const NUM_LEVELS: u32 = 4;
const BITS_PER_LEVEL: u32 = 9;
const PAGE_SHIFT: u32 = 12;

/// Translation shift at which `level` operates; L0 is coarsest.
pub const fn level_shift(level: u32) -> u32 {
    PAGE_SHIFT + (NUM_LEVELS - 1 - level) * BITS_PER_LEVEL
}

/// Block mappings are permitted at L1/L2 (1GB/2MB) but never at L0: the
/// architecture requires L0 to always be a table, since a single L0
/// entry spans 512GB, larger than any block descriptor can encode.
pub const fn level_is_block_capable(level: u32) -> bool {
    level > 0 && level < NUM_LEVELS - 1
}

fn index_at(vaddr: u64, level: u32) -> usize {
    ((vaddr >> level_shift(level)) & 0x1FF) as usize
}

/// What an operation wants to do at each descriptor the walk visits.
/// `phys_base` fields always mean "the physical address the *start* of
/// the whole requested range should map to"; the walker derives each
/// leaf's physical address as `phys_base + (leaf_vaddr - start)`.
pub enum WalkOp {
    Map { phys_base: u64, attrs: Attrs },
    Remap { phys_base: u64, attrs: Attrs },
    Unmap,
    UnmapMatching { phys_base: u64 },
    Preallocate,
}

pub struct LookupResult {
    pub phys: u64,
    pub attrs: Attrs,
    pub level: u32,
}

/// Walk `root` over `[start, end)`, applying `op`. `start`/`end` must be
/// aligned to the smallest page size (4KB); callers enforce this at the
/// external interface (spec §4.3's `ArgumentAlignment` failure mode).
pub fn walk_apply(root: &mut Level, start: u64, end: u64, op: &WalkOp) -> HvResult<()> {
    if start >= end || start % 4096 != 0 || end % 4096 != 0 {
        return Err(HvError::ArgumentAlignment);
    }
    walk_level(root, 0, 0, start, start, end, op)
}

fn walk_level(
    table: &mut Level,
    level: u32,
    table_vbase: u64,
    op_start: u64,
    end: u64,
    op: &WalkOp,
) -> HvResult<()> {
    let shift = level_shift(level);
    let entry_size = 1u64 << shift;
    let table_span = entry_size << BITS_PER_LEVEL;
    let walk_start = op_start.max(table_vbase);
    let walk_end = end.min(table_vbase + table_span);
    if walk_start >= walk_end {
        return Ok(());
    }
    let first = index_at(walk_start, level);
    let last = index_at(walk_end - 1, level);

    for idx in first..=last {
        let entry_vbase = table_vbase + (idx as u64) * entry_size;
        let region_start = entry_vbase.max(op_start);
        let region_end = (entry_vbase + entry_size).min(end);
        if region_start >= region_end {
            continue;
        }
        let fully_covered = region_start == entry_vbase && region_end == entry_vbase + entry_size;
        apply_one(table, idx, level, entry_vbase, op_start, region_start, region_end, fully_covered, end, op)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_one(
    parent: &mut Level,
    idx: usize,
    level: u32,
    entry_vbase: u64,
    op_start: u64,
    region_start: u64,
    region_end: u64,
    fully_covered: bool,
    end: u64,
    op: &WalkOp,
) -> HvResult<()> {
    let desc = parent.descriptors[idx];
    match op {
        WalkOp::Map { phys_base, attrs } => {
            if fully_covered && (level == NUM_LEVELS - 1 || level_is_block_capable(level)) {
                if desc.is_table_bit_set_at_leaf(level) {
                    free_subtree(desc);
                }
                let phys = *phys_base + (entry_vbase - op_start);
                parent.descriptors[idx] = leaf_descriptor(level, phys, *attrs);
                super::tlb::maintain_after_unmap();
                return Ok(());
            }
            let child = ensure_table(parent, idx, level)?;
            walk_level(child, level + 1, entry_vbase, op_start, end, op)
        }
        WalkOp::Remap { phys_base, attrs } => {
            if !desc.is_valid() {
                return Ok(());
            }
            if !desc.is_table_bit_set_at_leaf(level) {
                if fully_covered {
                    let target_phys = *phys_base + (entry_vbase - op_start);
                    if desc.addr() == target_phys {
                        parent.descriptors[idx] = desc.with_attrs(*attrs);
                    }
                }
                return Ok(());
            }
            let child_ptr = table_ptr(desc);
            walk_level(unsafe { &mut *child_ptr }, level + 1, entry_vbase, op_start, end, op)
        }
        WalkOp::Unmap => {
            if !desc.is_valid() {
                return Ok(());
            }
            if desc.is_table_bit_set_at_leaf(level) {
                let child_ptr = table_ptr(desc);
                walk_level(unsafe { &mut *child_ptr }, level + 1, entry_vbase, op_start, end, op)?;
                maybe_free_table(parent, idx, child_ptr);
                return Ok(());
            }
            if fully_covered {
                parent.descriptors[idx] = Descriptor::invalid();
                super::tlb::maintain_after_unmap();
            } else {
                split_block(parent, idx, level)?;
                let child_ptr = table_ptr(parent.descriptors[idx]);
                walk_level(unsafe { &mut *child_ptr }, level + 1, entry_vbase, op_start, end, op)?;
                maybe_free_table(parent, idx, child_ptr);
            }
            Ok(())
        }
        WalkOp::UnmapMatching { phys_base } => {
            if !desc.is_valid() {
                return Ok(());
            }
            if desc.is_table_bit_set_at_leaf(level) {
                let child_ptr = table_ptr(desc);
                walk_level(unsafe { &mut *child_ptr }, level + 1, entry_vbase, op_start, end, op)?;
                maybe_free_table(parent, idx, child_ptr);
                return Ok(());
            }
            if fully_covered {
                let expect_phys = *phys_base + (entry_vbase - op_start);
                if desc.addr() == expect_phys {
                    parent.descriptors[idx] = Descriptor::invalid();
                    super::tlb::maintain_after_unmap();
                }
            }
            Ok(())
        }
        WalkOp::Preallocate => {
            if fully_covered && (level == NUM_LEVELS - 1 || (level_is_block_capable(level) && desc.is_valid())) {
                return Ok(());
            }
            if level == NUM_LEVELS - 1 {
                return Ok(());
            }
            let child = ensure_table(parent, idx, level)?;
            walk_level(child, level + 1, entry_vbase, op_start, end, op)
        }
    }
}

fn leaf_descriptor(level: u32, phys: u64, attrs: Attrs) -> Descriptor {
    if level == NUM_LEVELS - 1 {
        Descriptor::page(phys, attrs)
    } else {
        Descriptor::block(phys, attrs)
    }
}

/// Recursively free a table subtree and its heap-backed levels (used
/// when a `Map` overwrites a table with a block/page, collapsing it).
fn free_subtree(desc: Descriptor) {
    if !desc.is_valid() {
        return;
    }
    // Only table descriptors at non-leaf levels carry a heap pointer;
    // the caller only invokes this on a descriptor already known to be
    // a table at its level, so just reclaim it. Children beneath it
    // are reclaimed transitively by `Box`'s drop glue walking entries
    // only if we recurse explicitly, since `Level` has no `Drop` impl.
    let ptr = table_ptr(desc);
    let level = unsafe { &*ptr };
    for child_desc in level.descriptors.iter() {
        if child_desc.is_valid() && child_desc.is_table_bit_set() {
            free_subtree(*child_desc);
        }
    }
    unsafe { drop(Box::from_raw(ptr)) };
}

fn ensure_table<'a>(parent: &'a mut Level, idx: usize, level: u32) -> HvResult<&'a mut Level> {
    let desc = parent.descriptors[idx];
    if desc.is_table_bit_set_at_leaf(level) {
        let ptr = table_ptr(desc);
        return Ok(unsafe { &mut *ptr });
    }
    if desc.is_valid() {
        split_block(parent, idx, level)?;
        let ptr = table_ptr(parent.descriptors[idx]);
        return Ok(unsafe { &mut *ptr });
    }
    let new_level = Level::zeroed();
    let raw = Box::into_raw(new_level);
    parent.descriptors[idx] = Descriptor::table(raw as u64, 0);
    Ok(unsafe { &mut *raw })
}

/// Replace a block descriptor at `level` with a freshly allocated table
/// of `level+1` descriptors covering the same region with the same
/// attrs (break-before-make: the block is invalidated, TLB-maintained,
/// then the table is installed).
fn split_block(parent: &mut Level, idx: usize, level: u32) -> HvResult<()> {
    let desc = parent.descriptors[idx];
    if level + 1 > NUM_LEVELS - 1 {
        return Err(HvError::ArgumentAlignment);
    }
    let attrs = desc.attrs();
    let base = desc.addr();
    parent.descriptors[idx] = Descriptor::invalid();
    super::tlb::maintain_after_unmap();

    let mut child = Level::zeroed();
    let child_entry_size = 1u64 << level_shift(level + 1);
    for (i, slot) in child.descriptors.iter_mut().enumerate() {
        let phys = base + (i as u64) * child_entry_size;
        *slot = leaf_descriptor(level + 1, phys, attrs);
    }
    let raw = Box::into_raw(child);
    parent.descriptors[idx] = Descriptor::table(raw as u64, 512);
    Ok(())
}

fn table_ptr(desc: Descriptor) -> *mut Level {
    desc.addr() as *mut Level
}

/// After unmapping within a child table, free it back to the heap if it
/// now has no valid entries, dropping the parent's reference to it.
fn maybe_free_table(parent: &mut Level, idx: usize, child_ptr: *mut Level) {
    let child = unsafe { &*child_ptr };
    let live = child.descriptors.iter().any(|d| d.is_valid());
    if !live {
        unsafe { drop(Box::from_raw(child_ptr)) };
        parent.descriptors[idx] = Descriptor::invalid();
    }
}

/// Find the mapping (if any) covering `vaddr`.
pub fn lookup(root: &Level, vaddr: u64) -> Option<LookupResult> {
    lookup_level(root, 0, 0, vaddr)
}

fn lookup_level(table: &Level, level: u32, table_vbase: u64, vaddr: u64) -> Option<LookupResult> {
    let idx = index_at(vaddr, level);
    let desc = table.descriptors[idx];
    if !desc.is_valid() {
        return None;
    }
    if desc.is_table_bit_set_at_leaf(level) {
        let child = unsafe { &*table_ptr(desc) };
        let entry_vbase = table_vbase + (idx as u64) * (1u64 << level_shift(level));
        return lookup_level(child, level + 1, entry_vbase, vaddr);
    }
    let shift = level_shift(level);
    let offset = vaddr & ((1u64 << shift) - 1);
    Some(LookupResult {
        phys: desc.addr() + offset,
        attrs: desc.attrs(),
        level,
    })
}

impl Descriptor {
    /// Whether, at `level`, this descriptor's bit[1] set means "points
    /// at a child table" (true everywhere except the last level, where
    /// bit[1] set instead means "page descriptor").
    fn is_table_bit_set_at_leaf(self, level: u32) -> bool {
        level != NUM_LEVELS - 1 && self.is_table_bit_set()
    }
}
