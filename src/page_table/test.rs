// SPDX-License-Identifier: MPL-2.0

use super::*;

const RW: PteFlags = PteFlags::RW;

#[test]
fn round_trip() {
    let mut pt = PageTable::new();
    let iova = 0x1000_0000;
    let paddr = 0x2000_0000;
    let len = 8 * PAGE_SIZE;
    assert_eq!(pt.map(iova, paddr, len, RW), len);
    for k in (0..len).step_by(PAGE_SIZE) {
        assert_eq!(pt.translate(iova + k), Some((paddr + k, PAGE_SIZE)));
    }
    assert_eq!(pt.translate(iova + len), None);
}

#[test]
fn translate_absent_is_none() {
    let pt = PageTable::new();
    assert_eq!(pt.translate(0), None);
    assert_eq!(pt.translate(0x4000_0000), None);
    assert_eq!(pt.translate(MAX_IOVA), None);
}

#[test]
fn unmap_never_mapped_is_zero() {
    let mut pt = PageTable::new();
    assert_eq!(pt.unmap(0x1000_0000, 16 * PAGE_SIZE), 0);
    // A second time is just as silent.
    assert_eq!(pt.unmap(0x1000_0000, 16 * PAGE_SIZE), 0);
}

#[test]
fn unmap_clears_and_counts_only_mapped_bytes() {
    let mut pt = PageTable::new();
    let iova = 0x800_0000;
    assert_eq!(pt.map(iova, 0x100_0000, 2 * PAGE_SIZE, RW), 2 * PAGE_SIZE);
    // The range asked for is twice what is mapped.
    assert_eq!(pt.unmap(iova, 4 * PAGE_SIZE), 2 * PAGE_SIZE);
    assert_eq!(pt.translate(iova), None);
    assert_eq!(pt.unmap(iova, 4 * PAGE_SIZE), 0);
}

#[test]
fn remap_overwrites() {
    let mut pt = PageTable::new();
    let iova = 0x40_0000;
    assert_eq!(pt.map(iova, 0x1_0000, PAGE_SIZE, RW), PAGE_SIZE);
    assert_eq!(pt.map(iova, 0x8_0000, PAGE_SIZE, RW), PAGE_SIZE);
    assert_eq!(pt.translate(iova), Some((0x8_0000, PAGE_SIZE)));
}

#[test]
fn aligned_range_maps_as_huge() {
    let mut pt = PageTable::new();
    let iova = 2 * HUGE_PAGE_SIZE;
    let paddr = 5 * HUGE_PAGE_SIZE;
    assert_eq!(pt.map(iova, paddr, HUGE_PAGE_SIZE, RW), HUGE_PAGE_SIZE);
    assert_eq!(pt.translate(iova), Some((paddr, HUGE_PAGE_SIZE)));
    assert_eq!(
        pt.translate(iova + 37 * PAGE_SIZE),
        Some((paddr, HUGE_PAGE_SIZE))
    );
}

#[test]
fn misaligned_paddr_never_maps_huge() {
    let mut pt = PageTable::new();
    let iova = HUGE_PAGE_SIZE;
    let paddr = 3 * HUGE_PAGE_SIZE + PAGE_SIZE;
    assert_eq!(pt.map(iova, paddr, HUGE_PAGE_SIZE, RW), HUGE_PAGE_SIZE);
    // Mapped at page granularity, so every page translates exactly.
    assert_eq!(pt.translate(iova), Some((paddr, PAGE_SIZE)));
    let k = 100 * PAGE_SIZE;
    assert_eq!(pt.translate(iova + k), Some((paddr + k, PAGE_SIZE)));
}

#[test]
fn mapping_page_into_huge_range_splits_it() {
    let mut pt = PageTable::new();
    let iova = 4 * HUGE_PAGE_SIZE;
    let paddr = 8 * HUGE_PAGE_SIZE;
    let new_frame = 0x7000_0000;
    assert_eq!(pt.map(iova, paddr, HUGE_PAGE_SIZE, RW), HUGE_PAGE_SIZE);

    let patched = iova + 13 * PAGE_SIZE;
    assert_eq!(pt.map(patched, new_frame, PAGE_SIZE, RW), PAGE_SIZE);

    assert_eq!(pt.translate(patched), Some((new_frame, PAGE_SIZE)));
    for k in (0..HUGE_PAGE_SIZE).step_by(PAGE_SIZE) {
        if iova + k == patched {
            continue;
        }
        assert_eq!(pt.translate(iova + k), Some((paddr + k, PAGE_SIZE)));
    }
}

#[test]
fn unmapping_subrange_of_huge_preserves_remainder() {
    let mut pt = PageTable::new();
    let iova = 8 * HUGE_PAGE_SIZE;
    let paddr = 2 * HUGE_PAGE_SIZE;
    assert_eq!(pt.map(iova, paddr, HUGE_PAGE_SIZE, RW), HUGE_PAGE_SIZE);

    let hole = iova + HUGE_PAGE_SIZE / 2;
    assert_eq!(pt.unmap(hole, 2 * PAGE_SIZE), 2 * PAGE_SIZE);

    assert_eq!(pt.translate(hole), None);
    assert_eq!(pt.translate(hole + PAGE_SIZE), None);
    assert_eq!(pt.translate(iova), Some((paddr, PAGE_SIZE)));
    assert_eq!(
        pt.translate(hole + 2 * PAGE_SIZE),
        Some((paddr + HUGE_PAGE_SIZE / 2 + 2 * PAGE_SIZE, PAGE_SIZE))
    );
}

#[test]
fn unmapping_whole_huge_leaf_clears_it() {
    let mut pt = PageTable::new();
    let iova = 16 * HUGE_PAGE_SIZE;
    assert_eq!(pt.map(iova, 0, HUGE_PAGE_SIZE, RW), HUGE_PAGE_SIZE);
    assert_eq!(pt.unmap(iova, HUGE_PAGE_SIZE), HUGE_PAGE_SIZE);
    assert_eq!(pt.translate(iova), None);
    assert_eq!(pt.translate(iova + HUGE_PAGE_SIZE - PAGE_SIZE), None);
}

#[test]
fn map_spanning_huge_boundary_mixes_granularities() {
    let mut pt = PageTable::new();
    // One page before a huge boundary, then a full huge unit.
    let iova = HUGE_PAGE_SIZE - PAGE_SIZE;
    let paddr = 3 * HUGE_PAGE_SIZE - PAGE_SIZE;
    let len = PAGE_SIZE + HUGE_PAGE_SIZE;
    assert_eq!(pt.map(iova, paddr, len, RW), len);
    assert_eq!(pt.translate(iova), Some((paddr, PAGE_SIZE)));
    assert_eq!(
        pt.translate(HUGE_PAGE_SIZE),
        Some((3 * HUGE_PAGE_SIZE, HUGE_PAGE_SIZE))
    );
}

#[test]
fn geometry_constants() {
    assert_eq!(PAGE_SIZE, 0x4000);
    assert_eq!(ENTRIES_PER_TABLE, 2048);
    assert_eq!(LEVEL_MAX, 3);
    assert_eq!(HUGE_PAGE_SIZE, 32 << 20);
}
