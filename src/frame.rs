// SPDX-License-Identifier: MPL-2.0

//! Page-table frames.
//!
//! Table frames come from the host's page-aligned allocator and are born
//! zeroed, so a freshly allocated table maps nothing. The engine runs with
//! an identity linear mapping: the address of a frame is also the address
//! the hardware walks, which is what the physical-table backend of the
//! hardware expects.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use crate::Paddr;

/// Base-2 logarithm of the I/O page size.
pub const PAGE_SHIFT: usize = 14;
/// The I/O page size. One table frame is exactly one page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// The number of 64-bit entries in one table frame.
pub const ENTRIES_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// One zeroed, page-aligned frame holding [`ENTRIES_PER_TABLE`] entries.
pub(crate) struct TableFrame {
    ptr: NonNull<u64>,
}

impl TableFrame {
    const fn layout() -> Layout {
        // PAGE_SIZE is a non-zero power of two.
        unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
    }

    /// Allocates a zeroed frame, or returns `None` when the allocator is
    /// out of memory.
    pub(crate) fn alloc_zeroed() -> Option<Self> {
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        NonNull::new(ptr.cast()).map(|ptr| Self { ptr })
    }

    /// The hardware-visible base address of this frame.
    pub(crate) fn paddr(&self) -> Paddr {
        self.ptr.as_ptr() as Paddr
    }
}

impl Drop for TableFrame {
    fn drop(&mut self) {
        // SAFETY: the pointer was returned by `alloc_zeroed` with the same
        // layout and is owned exclusively by this frame.
        unsafe { dealloc(self.ptr.as_ptr().cast(), Self::layout()) };
    }
}

// SAFETY: a frame is plain owned memory; entry access is serialized by the
// owning page table's lock.
unsafe impl Send for TableFrame {}
unsafe impl Sync for TableFrame {}

/// Views the frame at `pa` as a mutable slice of entries.
///
/// # Safety
///
/// `pa` must be the base address of a live table frame owned by the calling
/// page table, and the caller must hold that table's mutation lock. No other
/// reference to the same frame may be live.
pub(crate) unsafe fn table_of<'a>(pa: Paddr) -> &'a mut [u64] {
    core::slice::from_raw_parts_mut(pa as *mut u64, ENTRIES_PER_TABLE)
}

/// Views the frame at `pa` as a shared slice of entries.
///
/// # Safety
///
/// `pa` must be the base address of a live table frame owned by the calling
/// page table, with no concurrent mutation of the same table.
pub(crate) unsafe fn table_of_ref<'a>(pa: Paddr) -> &'a [u64] {
    core::slice::from_raw_parts(pa as *const u64, ENTRIES_PER_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_aligned_and_zeroed() {
        let frame = TableFrame::alloc_zeroed().unwrap();
        assert_eq!(frame.paddr() % PAGE_SIZE, 0);
        let entries = unsafe { table_of_ref(frame.paddr()) };
        assert_eq!(entries.len(), ENTRIES_PER_TABLE);
        assert!(entries.iter().all(|&pte| pte == 0));
    }
}
