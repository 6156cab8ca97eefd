// SPDX-License-Identifier: MPL-2.0

//! Bitmap-backed allocation of scarce hardware indexes.

use bitvec::prelude::BitVec;

/// An id allocator implemented by a bitmap.
///
/// The true bit implies that the id is claimed, and vice versa. Allocation
/// always claims the lowest-numbered free id, matching what the hardware
/// expects for domain IDs and device-table slots.
#[derive(Clone)]
pub struct IdAlloc {
    bitset: BitVec<u8>,
    first_free: usize,
    allocated: usize,
}

impl IdAlloc {
    /// Constructs a new id allocator with a maximum capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut bitset = BitVec::with_capacity(capacity);
        bitset.resize(capacity, false);
        Self {
            bitset,
            first_free: 0,
            allocated: 0,
        }
    }

    /// Claims and returns the lowest free id.
    ///
    /// Returns `None` when the bitmap is saturated.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.first_free >= self.bitset.len() {
            return None;
        }
        let id = self.first_free;
        self.bitset.set(id, true);
        self.allocated += 1;
        self.first_free = (id + 1..self.bitset.len())
            .find(|&i| !self.bitset[i])
            .unwrap_or(self.bitset.len());
        Some(id)
    }

    /// Releases a previously claimed id.
    ///
    /// Releasing an unclaimed or out-of-range id is a no-op; in debug builds
    /// it is flagged as a caller bug.
    pub fn free(&mut self, id: usize) {
        let claimed = self.bitset.get(id).map(|bit| *bit).unwrap_or(false);
        debug_assert!(claimed, "freeing unclaimed id {}", id);
        if !claimed {
            return;
        }
        self.bitset.set(id, false);
        self.allocated -= 1;
        if id < self.first_free {
            self.first_free = id;
        }
    }

    /// Returns true if the `id` is currently claimed.
    pub fn is_allocated(&self, id: usize) -> bool {
        self.bitset.get(id).map(|bit| *bit).unwrap_or(false)
    }

    /// Returns the number of currently claimed ids.
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }

    /// Returns the maximum number of ids this allocator can hand out.
    pub fn capacity(&self) -> usize {
        self.bitset.len()
    }
}

impl core::fmt::Debug for IdAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("IdAlloc")
            .field("capacity", &self.bitset.len())
            .field("allocated", &self.allocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_id() {
        let mut alloc = IdAlloc::with_capacity(4);
        assert_eq!(alloc.alloc(), Some(0));
        assert_eq!(alloc.alloc(), Some(1));
        alloc.free(0);
        assert_eq!(alloc.alloc(), Some(0));
        assert_eq!(alloc.alloc(), Some(2));
    }

    #[test]
    fn saturation_returns_none() {
        let mut alloc = IdAlloc::with_capacity(2);
        assert_eq!(alloc.alloc(), Some(0));
        assert_eq!(alloc.alloc(), Some(1));
        assert_eq!(alloc.alloc(), None);
        alloc.free(1);
        assert_eq!(alloc.alloc(), Some(1));
        assert_eq!(alloc.alloc(), None);
    }

    #[test]
    fn tracks_allocated_count() {
        let mut alloc = IdAlloc::with_capacity(8);
        assert_eq!(alloc.allocated_count(), 0);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert_eq!(alloc.allocated_count(), 2);
        assert!(alloc.is_allocated(a));
        alloc.free(a);
        assert_eq!(alloc.allocated_count(), 1);
        assert!(!alloc.is_allocated(a));
        assert!(alloc.is_allocated(b));
    }

    #[test]
    fn zero_capacity_never_allocates() {
        let mut alloc = IdAlloc::with_capacity(0);
        assert_eq!(alloc.alloc(), None);
        assert_eq!(alloc.capacity(), 0);
    }
}
