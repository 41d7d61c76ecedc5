//! Radix-trie operations: insert, update (range CAS), lookup, walk,
//! range_walk, is_ownership_contiguous.
//!
//! Validation is split from mutation: `insert`/`update` first walk the
//! requested range read-only to confirm every overlapped leaf satisfies
//! the precondition (unmapped for insert, equal to `expected` for
//! update), then only commit once that whole-range check has passed.
//! This gives the same all-or-nothing semantics as the reference
//! database's explicit stack-based rollback without needing to unwind
//! partial writes by hand.

use crate::config::{MEMDB_BITS_PER_ENTRY, MEMDB_KEY_BITS};
use crate::error::{HvError, HvResult};
use crate::sync::SpinLock;

use super::entry::{Entry, Level, ObjectType, OwnerId};

/// The root entry's node_shift: the whole key space is unresolved above
/// the root, so it spans all `MEMDB_KEY_BITS` bits.
fn top_shift() -> u32 {
    MEMDB_KEY_BITS
}

/// How many bits of index a level at `node_shift` consumes. Every level
/// consumes a full `MEMDB_BITS_PER_ENTRY` except the last, which consumes
/// whatever is left when `MEMDB_KEY_BITS` isn't a multiple of it.
fn consumed_bits(node_shift: u32) -> u32 {
    core::cmp::min(MEMDB_BITS_PER_ENTRY, node_shift)
}

fn index_at(key: u64, child_shift: u32, consumed: u32) -> usize {
    let mask = (1u64 << consumed) - 1;
    ((key >> child_shift) & mask) as usize
}

#[derive(Clone, Copy)]
enum Want {
    Unmapped,
    Equals(OwnerId, ObjectType),
}

/// A paddr-keyed radix trie mapping every physical address to either
/// "unmapped" or a `(owner, object type)` leaf.
pub struct Memdb {
    root: SpinLock<Entry>,
}

impl Memdb {
    /// Construct an empty database. There is deliberately no reset/reinit
    /// operation: `memdb_init` is one-shot by construction here.
    pub fn new() -> Self {
        Self {
            root: SpinLock::new(Entry::NoType),
        }
    }

    pub fn insert(&self, start: u64, end: u64, owner: OwnerId, ty: ObjectType) -> HvResult<()> {
        self.set_range(start, end, owner, ty, Want::Unmapped)
    }

    pub fn update(
        &self,
        start: u64,
        end: u64,
        expected_owner: OwnerId,
        expected_ty: ObjectType,
        new_owner: OwnerId,
        new_ty: ObjectType,
    ) -> HvResult<()> {
        self.set_range(
            start,
            end,
            new_owner,
            new_ty,
            Want::Equals(expected_owner, expected_ty),
        )
    }

    fn set_range(
        &self,
        start: u64,
        end: u64,
        owner: OwnerId,
        ty: ObjectType,
        want: Want,
    ) -> HvResult<()> {
        if start > end {
            return Err(HvError::ArgumentInvalid);
        }
        let mut root = self.root.lock();
        check_range(&root, 0, top_shift(), start, end, want)?;
        apply_range(&mut root, 0, top_shift(), start, end, owner, ty);
        Ok(())
    }

    pub fn lookup(&self, addr: u64) -> Option<(OwnerId, ObjectType)> {
        let root = self.root.lock();
        lookup_rec(&root, 0, top_shift(), addr)
    }

    /// Visit every maximal contiguous range whose leaf matches `filter`
    /// (or every mapped range, if `filter` is `None`).
    pub fn walk<F>(&self, filter: Option<(OwnerId, ObjectType)>, mut callback: F)
    where
        F: FnMut(u64, u64),
    {
        self.range_walk(0, u64::MAX, filter, &mut callback);
    }

    pub fn range_walk<F>(&self, start: u64, end: u64, filter: Option<(OwnerId, ObjectType)>, callback: &mut F)
    where
        F: FnMut(u64, u64),
    {
        let root = self.root.lock();
        let mut spans = alloc::vec::Vec::new();
        collect_spans(&root, 0, top_shift(), start, end, &mut spans);
        drop(root);

        let mut pending: Option<(u64, u64, OwnerId, ObjectType)> = None;
        for (base, size, owner, ty) in spans {
            if let Some((o, t)) = filter {
                if owner != o || ty != t {
                    if let Some((pb, ps, _, _)) = pending.take() {
                        callback(pb, ps);
                    }
                    continue;
                }
            }
            match pending {
                Some((pb, ps, po, pt)) if pb + ps == base && po == owner && pt == ty => {
                    pending = Some((pb, ps + size, po, pt));
                }
                Some((pb, ps, _, _)) => {
                    callback(pb, ps);
                    pending = Some((base, size, owner, ty));
                }
                None => pending = Some((base, size, owner, ty)),
            }
        }
        if let Some((pb, ps, _, _)) = pending {
            callback(pb, ps);
        }
    }

    pub fn is_ownership_contiguous(
        &self,
        start: u64,
        end: u64,
        owner: OwnerId,
        ty: ObjectType,
    ) -> bool {
        if start > end {
            return false;
        }
        let mut covered: u64 = 0;
        let want_len = end - start + 1;
        let mut ok = true;
        self.range_walk(start, end, Some((owner, ty)), &mut |base, size| {
            if base != start + covered {
                ok = false;
            }
            covered += size;
        });
        ok && covered == want_len
    }
}

impl Default for Memdb {
    fn default() -> Self {
        Self::new()
    }
}

/// Does `[start,end]` (inclusive) fully cover `[node_base, node_base +
/// 2^node_shift)`?
fn node_fully_covered(node_base: u64, node_shift: u32, start: u64, end: u64) -> bool {
    let node_size: u128 = 1u128 << node_shift;
    let node_end = node_base as u128 + node_size - 1;
    (start as u128) <= node_base as u128 && (end as u128) >= node_end
}

fn node_overlaps(node_base: u64, node_shift: u32, start: u64, end: u64) -> bool {
    let node_size: u128 = 1u128 << node_shift;
    let node_end = node_base as u128 + node_size - 1;
    !((end as u128) < node_base as u128 || (start as u128) > node_end)
}

fn check_range(entry: &Entry, node_base: u64, node_shift: u32, start: u64, end: u64, want: Want) -> HvResult<()> {
    if !node_overlaps(node_base, node_shift, start, end) {
        return Ok(());
    }
    match entry {
        Entry::NoType => match want {
            Want::Unmapped => Ok(()),
            Want::Equals(..) => Err(HvError::ExistingMapping),
        },
        Entry::Leaf { owner, ty, .. } => match want {
            Want::Unmapped => Err(HvError::ExistingMapping),
            Want::Equals(eo, et) => {
                if *owner == eo && *ty == et {
                    Ok(())
                } else {
                    Err(HvError::ExistingMapping)
                }
            }
        },
        Entry::Level { level, .. } => {
            let consumed = consumed_bits(node_shift);
            let child_shift = node_shift - consumed;
            for i in 0..(1usize << consumed) {
                let child_base = node_base + ((i as u64) << child_shift);
                if !node_overlaps(child_base, child_shift, start, end) {
                    continue;
                }
                check_range(&level.entries[i], child_base, child_shift, start, end, want)?;
            }
            Ok(())
        }
    }
}

fn apply_range(
    entry: &mut Entry,
    node_base: u64,
    node_shift: u32,
    start: u64,
    end: u64,
    owner: OwnerId,
    ty: ObjectType,
) {
    if !node_overlaps(node_base, node_shift, start, end) {
        return;
    }

    if node_fully_covered(node_base, node_shift, start, end) {
        *entry = Entry::Leaf {
            owner,
            ty,
            guard: 0,
            shifts: node_shift,
        };
        return;
    }

    // Partial overlap: expand this node into a level if it is not one
    // already (a node_shift of 0 can never reach here, since a
    // single-address node is always either fully covered or disjoint),
    // then recurse into the overlapping children.
    let consumed = consumed_bits(node_shift);
    let child_shift = node_shift - consumed;
    let nslots = 1usize << consumed;

    if !matches!(entry, Entry::Level { .. }) {
        let prior = match entry {
            Entry::NoType => None,
            Entry::Leaf { owner, ty, .. } => Some((*owner, *ty)),
            Entry::Level { .. } => unreachable!(),
        };
        let mut level = Level::empty();
        if let Some((o, t)) = prior {
            for slot in level.entries.iter_mut().take(nslots) {
                *slot = Entry::Leaf {
                    owner: o,
                    ty: t,
                    guard: 0,
                    shifts: child_shift,
                };
            }
        }
        *entry = Entry::Level {
            level,
            guard: 0,
            shifts: node_shift,
        };
    }

    if let Entry::Level { level, .. } = entry {
        for i in 0..nslots {
            let child_base = node_base + ((i as u64) << child_shift);
            if !node_overlaps(child_base, child_shift, start, end) {
                continue;
            }
            apply_range(&mut level.entries[i], child_base, child_shift, start, end, owner, ty);
        }
    }
}

fn lookup_rec(entry: &Entry, node_base: u64, node_shift: u32, addr: u64) -> Option<(OwnerId, ObjectType)> {
    match entry {
        Entry::NoType => None,
        Entry::Leaf { owner, ty, .. } => Some((*owner, *ty)),
        Entry::Level { level, .. } => {
            let consumed = consumed_bits(node_shift);
            let child_shift = node_shift - consumed;
            let idx = index_at(addr, child_shift, consumed);
            let child_base = node_base + ((idx as u64) << child_shift);
            lookup_rec(&level.entries[idx], child_base, child_shift, addr)
        }
    }
}

fn collect_spans(
    entry: &Entry,
    node_base: u64,
    node_shift: u32,
    start: u64,
    end: u64,
    out: &mut alloc::vec::Vec<(u64, u64, OwnerId, ObjectType)>,
) {
    if !node_overlaps(node_base, node_shift, start, end) {
        return;
    }
    match entry {
        Entry::NoType => {}
        Entry::Leaf { owner, ty, .. } => {
            let node_size: u128 = 1u128 << node_shift;
            let node_end = node_base as u128 + node_size - 1;
            let clip_start = core::cmp::max(node_base as u128, start as u128) as u64;
            let clip_end = core::cmp::min(node_end, end as u128) as u64;
            if clip_start <= clip_end {
                out.push((clip_start, clip_end - clip_start + 1, *owner, *ty));
            }
        }
        Entry::Level { level, .. } => {
            let consumed = consumed_bits(node_shift);
            let child_shift = node_shift - consumed;
            for i in 0..(1usize << consumed) {
                let child_base = node_base + ((i as u64) << child_shift);
                collect_spans(&level.entries[i], child_base, child_shift, start, end, out);
            }
        }
    }
}
