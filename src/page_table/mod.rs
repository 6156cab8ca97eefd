// SPDX-License-Identifier: MPL-2.0

//! The multi-level I/O page table.
//!
//! The table is a radix tree of [`LEVEL_MAX`] levels walked from the top
//! level down to level 0, whose entries are page-sized leaves. An entry at
//! level 1 may instead be a huge leaf covering [`HUGE_PAGE_SIZE`] bytes in
//! one step. Mapping a finer granularity into a huge leaf first splits it
//! into a full level-0 table so the rest of the huge range stays mapped.

use alloc::vec::Vec;

use bitflags::bitflags;
use log::trace;

use crate::{
    frame::{table_of, table_of_ref, TableFrame, ENTRIES_PER_TABLE, PAGE_SIZE},
    Iova, Paddr,
};

#[cfg(test)]
mod test;

/// The number of IOVA bits the hardware translates.
pub const IOVA_WIDTH: usize = 47;
/// One more than the highest translatable IOVA.
pub const MAX_IOVA: usize = 1 << IOVA_WIDTH;

pub(crate) const LEVEL_STRIDE: usize = crate::frame::PAGE_SHIFT - 3;
/// The number of levels in the table.
pub const LEVEL_MAX: usize =
    (IOVA_WIDTH - crate::frame::PAGE_SHIFT + LEVEL_STRIDE - 1) / LEVEL_STRIDE;

const PT_LEVEL0: usize = 0;
const PT_LEVEL1: usize = 1;

/// The size of the range one huge leaf covers.
pub const HUGE_PAGE_SIZE: usize = level_size(PT_LEVEL1);

const PAGE_MASK: usize = !(PAGE_SIZE - 1);
const HUGE_PAGE_MASK: usize = !(HUGE_PAGE_SIZE - 1);

pub(crate) const fn level_shift(level: usize) -> usize {
    level * LEVEL_STRIDE + crate::frame::PAGE_SHIFT
}

const fn level_size(level: usize) -> usize {
    1 << level_shift(level)
}

bitflags! {
    /// Bit fields of an I/O page-table entry.
    pub struct PteFlags: u64 {
        /// The entry is valid.
        const PRESENT = 1 << 0;
        /// The entry is a huge leaf (meaningful at level 1 only).
        const HUGE = 1 << 1;
        /// The range may be read by the device.
        const READABLE = 1 << 2;
        /// The range may be written by the device.
        const WRITABLE = 1 << 3;
        /// Present, readable and writable.
        const RW = Self::PRESENT.bits | Self::READABLE.bits | Self::WRITABLE.bits;
    }
}

const PTE_PERMS: u64 = PteFlags::READABLE.bits() | PteFlags::WRITABLE.bits();

fn pte_present(pte: u64) -> bool {
    pte & PteFlags::PRESENT.bits() != 0
}

fn pte_huge(pte: u64) -> bool {
    pte & PteFlags::HUGE.bits() != 0
}

fn pte_paddr(pte: u64) -> Paddr {
    pte as Paddr & PAGE_MASK
}

/// The entry index covering `iova` within a table of the given level.
fn pte_index(iova: Iova, level: usize) -> usize {
    (iova >> level_shift(level)) & (ENTRIES_PER_TABLE - 1)
}

/// The end of the current entry's range at `level`, clamped to `end`.
fn table_end(iova: Iova, end: Iova, level: usize) -> Iova {
    let boundary = (iova + level_size(level)) & !(level_size(level) - 1);
    boundary.min(end)
}

fn entry(table: Paddr, index: usize) -> u64 {
    // SAFETY: `table` is a live frame of the walked page table and the
    // reference does not outlive this read.
    unsafe { table_of_ref(table)[index] }
}

fn set_entry(table: Paddr, index: usize, pte: u64) {
    // SAFETY: as in `entry`, and mutation is serialized by the owning
    // table's lock.
    unsafe { table_of(table)[index] = pte };
}

fn leaf_pte(paddr: Paddr, prot: PteFlags) -> u64 {
    (paddr & PAGE_MASK) as u64 | (prot.bits() & PTE_PERMS) | PteFlags::PRESENT.bits()
}

fn huge_pte(paddr: Paddr, prot: PteFlags) -> u64 {
    (paddr & HUGE_PAGE_MASK) as u64
        | (prot.bits() & PTE_PERMS)
        | PteFlags::PRESENT.bits()
        | PteFlags::HUGE.bits()
}

/// Writes full-granularity leaves for `[start, end)` into the level-0 table
/// at `table`. The caller guarantees the range falls within one table.
fn fill_leaf_range(table: Paddr, start: Iova, end: Iova, paddr: Paddr, prot: PteFlags) -> usize {
    // SAFETY: the slice covers a frame owned by the calling page table and
    // is dropped before any other table access.
    let entries = unsafe { table_of(table) };
    let mut index = pte_index(start, PT_LEVEL0);
    let mut cur = start;
    let mut pa = paddr & PAGE_MASK;
    while cur < end {
        entries[index] = leaf_pte(pa, prot);
        index += 1;
        cur += PAGE_SIZE;
        pa += PAGE_SIZE;
    }
    cur - start
}

/// A multi-level I/O page table owning all of its table frames.
///
/// All mutation must be serialized by the caller; the owning domain holds
/// the table behind its page-table lock.
pub struct PageTable {
    root: TableFrame,
    tables: Vec<TableFrame>,
}

impl PageTable {
    /// Creates an empty table with an allocated top-level frame.
    ///
    /// # Panics
    ///
    /// Panics if the top-level frame cannot be allocated.
    pub fn new() -> Self {
        let root = TableFrame::alloc_zeroed().expect("failed to allocate the page-table root");
        Self {
            root,
            tables: Vec::new(),
        }
    }

    /// The hardware-visible address of the top-level table, programmed into
    /// the unit's page-table base registers.
    pub fn root_paddr(&self) -> Paddr {
        self.root.paddr()
    }

    /// Maps `[iova, iova + len)` to `[paddr, paddr + len)` with `prot`.
    ///
    /// All three arguments must be page-aligned. Remapping an existing range
    /// overwrites it. Returns the number of bytes actually mapped; a short
    /// count means a table frame could not be allocated midway, and the
    /// caller decides whether to unwind.
    pub fn map(&mut self, iova: Iova, paddr: Paddr, len: usize, prot: PteFlags) -> usize {
        debug_assert!(iova % PAGE_SIZE == 0 && paddr % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        if len == 0 {
            return 0;
        }
        trace!("iommu pt: map iova {:#x} -> {:#x} len {:#x}", iova, paddr, len);
        let root = self.root.paddr();
        self.map_range(root, iova, iova + len, paddr, LEVEL_MAX - 1, prot)
    }

    /// Clears every leaf covering `[iova, iova + len)` and returns the
    /// number of bytes that were actually mapped before. Unmapping part of a
    /// huge leaf splits it first so the remainder stays mapped.
    pub fn unmap(&mut self, iova: Iova, len: usize) -> usize {
        debug_assert!(iova % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        if len == 0 {
            return 0;
        }
        trace!("iommu pt: unmap iova {:#x} len {:#x}", iova, len);
        let root = self.root.paddr();
        self.unmap_range(root, iova, iova + len, LEVEL_MAX - 1)
    }

    /// Walks to the leaf covering `iova` and returns the mapped frame base
    /// together with the size class of the leaf.
    pub fn translate(&self, iova: Iova) -> Option<(Paddr, usize)> {
        if iova >= MAX_IOVA {
            return None;
        }
        let mut table = self.root.paddr();
        let mut level = LEVEL_MAX - 1;
        loop {
            let pte = entry(table, pte_index(iova, level));
            if !pte_present(pte) {
                return None;
            }
            if level == PT_LEVEL0 {
                return Some((pte_paddr(pte), PAGE_SIZE));
            }
            if level == PT_LEVEL1 && pte_huge(pte) {
                return Some((pte as Paddr & HUGE_PAGE_MASK, HUGE_PAGE_SIZE));
            }
            table = pte_paddr(pte);
            level -= 1;
        }
    }

    fn map_range(
        &mut self,
        table: Paddr,
        start: Iova,
        end: Iova,
        paddr: Paddr,
        level: usize,
        prot: PteFlags,
    ) -> usize {
        if level == PT_LEVEL0 {
            return fill_leaf_range(table, start, end, paddr, prot);
        }
        let mut cur = start;
        let mut pa = paddr;
        let mut mapped = 0;
        while cur < end {
            let next = table_end(cur, end, level);
            let step = next - cur;
            let index = pte_index(cur, level);
            let pte = entry(table, index);
            let fits_huge = level == PT_LEVEL1
                && step == HUGE_PAGE_SIZE
                && pa & (HUGE_PAGE_SIZE - 1) == 0
                && (!pte_present(pte) || pte_huge(pte));
            if fits_huge {
                set_entry(table, index, huge_pte(pa, prot));
                mapped += step;
            } else {
                if level == PT_LEVEL1 && pte_present(pte) && pte_huge(pte) {
                    if !self.split_huge_entry(table, index, cur & HUGE_PAGE_MASK) {
                        break;
                    }
                }
                let Some(child) = self.child_or_alloc(table, index) else {
                    break;
                };
                let n = self.map_range(child, cur, next, pa, level - 1, prot);
                mapped += n;
                if n != step {
                    break;
                }
            }
            cur = next;
            pa += step;
        }
        mapped
    }

    fn unmap_range(&mut self, table: Paddr, start: Iova, end: Iova, level: usize) -> usize {
        if level == PT_LEVEL0 {
            // SAFETY: as in `fill_leaf_range`.
            let entries = unsafe { table_of(table) };
            let mut index = pte_index(start, PT_LEVEL0);
            let mut cur = start;
            let mut cleared = 0;
            while cur < end {
                if entries[index] != 0 {
                    entries[index] = 0;
                    cleared += PAGE_SIZE;
                }
                index += 1;
                cur += PAGE_SIZE;
            }
            return cleared;
        }
        let mut cur = start;
        let mut cleared = 0;
        while cur < end {
            let next = table_end(cur, end, level);
            let index = pte_index(cur, level);
            let pte = entry(table, index);
            if !pte_present(pte) {
                cur = next;
                continue;
            }
            if level == PT_LEVEL1 && pte_huge(pte) {
                if next - cur == HUGE_PAGE_SIZE {
                    set_entry(table, index, 0);
                    cleared += HUGE_PAGE_SIZE;
                    cur = next;
                    continue;
                }
                if !self.split_huge_entry(table, index, cur & HUGE_PAGE_MASK) {
                    break;
                }
            }
            let child = pte_paddr(entry(table, index));
            cleared += self.unmap_range(child, cur, next, level - 1);
            cur = next;
        }
        cleared
    }

    /// Returns the child table under `entries[index]`, allocating and
    /// installing a fresh one when the entry is absent.
    fn child_or_alloc(&mut self, table: Paddr, index: usize) -> Option<Paddr> {
        let pte = entry(table, index);
        if pte_present(pte) {
            return Some(pte_paddr(pte));
        }
        let frame = TableFrame::alloc_zeroed()?;
        let pa = frame.paddr();
        set_entry(table, index, (pa & PAGE_MASK) as u64 | PteFlags::RW.bits());
        self.tables.push(frame);
        Some(pa)
    }

    /// Demotes the huge leaf at `entries[index]` into a level-0 table of
    /// full-granularity leaves covering the same range with the same
    /// permissions. `start` is the huge-aligned base of the leaf.
    fn split_huge_entry(&mut self, table: Paddr, index: usize, start: Iova) -> bool {
        let old = entry(table, index);
        let pa = old as Paddr & HUGE_PAGE_MASK;
        let prot = PteFlags::from_bits_truncate(old & PTE_PERMS);
        set_entry(table, index, 0);
        let Some(child) = self.child_or_alloc(table, index) else {
            set_entry(table, index, old);
            return false;
        };
        fill_leaf_range(child, start, start + HUGE_PAGE_SIZE, pa, prot);
        true
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
