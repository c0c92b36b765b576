extern crate std;

use core::{mem, ptr::NonNull, slice};
use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    buddy::{AllocFlags, BuddyPageAllocator, LAST_ORDER},
    frame::{Frame, FrameTable, Pfn},
};

const PAGE_BITS: u32 = 4;
const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Backing storage for a test allocator. The allocator works on the buffer
/// through raw pointers, so the region must outlive it and must not move.
struct Region {
    mem: Vec<u64>,
}

impl Region {
    fn new(num_frames: u64) -> Region {
        let words = num_frames as usize * PAGE_SIZE / mem::size_of::<u64>();
        let mut mem = Vec::with_capacity(words);
        mem.resize(words, 0);

        Region { mem }
    }

    /// Pre-dirties every byte of the region.
    fn fill(&mut self, word: u64) {
        for w in self.mem.iter_mut() {
            *w = word;
        }
    }

    fn allocator(&mut self, first_pfn: u64, num_frames: u64) -> BuddyPageAllocator<PAGE_BITS> {
        let base = NonNull::new(self.mem.as_mut_ptr().cast::<u8>()).unwrap();
        let table =
            unsafe { FrameTable::<PAGE_BITS>::new(base, Pfn::new(first_pfn), num_frames) }.unwrap();

        BuddyPageAllocator::new(table)
    }

    /// Builds an allocator over `[first_pfn, first_pfn + num_frames)` and
    /// hands it every frame.
    fn populated(&mut self, first_pfn: u64, num_frames: u64) -> BuddyPageAllocator<PAGE_BITS> {
        let mut alloc = self.allocator(first_pfn, num_frames);
        let start = alloc.frame_table().get_from_pfn(Pfn::new(first_pfn));
        unsafe { alloc.insert_free_pages(start, num_frames) };
        alloc
    }
}

/// Snapshots every free list as a vector of head PFNs, index = order.
fn free_lists(alloc: &BuddyPageAllocator<PAGE_BITS>) -> Vec<Vec<u64>> {
    (0..=LAST_ORDER)
        .map(|order| alloc.free_blocks(order).map(|f| f.pfn().get()).collect())
        .collect()
}

/// Checks the structural free-list invariants: per-order alignment, strictly
/// ascending order, no unmerged buddy pairs, and global disjointness.
fn check_invariants(alloc: &BuddyPageAllocator<PAGE_BITS>) {
    let mut extents: Vec<(u64, u64)> = Vec::new();

    for order in 0..=LAST_ORDER {
        let pages = 1u64 << order;
        let pfns: Vec<u64> = alloc.free_blocks(order).map(|f| f.pfn().get()).collect();

        for &pfn in &pfns {
            assert_eq!(pfn % pages, 0, "pfn {} misaligned at order {}", pfn, order);
            extents.push((pfn, pages));
        }

        for pair in pfns.windows(2) {
            assert!(
                pair[0] < pair[1],
                "order {} list not ascending: {} before {}",
                order,
                pair[0],
                pair[1]
            );
            if order < LAST_ORDER {
                assert_ne!(
                    pair[0] ^ pages,
                    pair[1],
                    "unmerged buddies {} and {} at order {}",
                    pair[0],
                    pair[1],
                    order
                );
            }
        }
    }

    extents.sort_unstable();
    for pair in extents.windows(2) {
        let (start, len) = pair[0];
        assert!(
            start + len <= pair[1].0,
            "free blocks overlap: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn out_of_range_orders_soft_fail() {
    let mut region = Region::new(8);
    let mut alloc = region.populated(0, 8);
    let before = free_lists(&alloc);

    assert_eq!(alloc.allocate_pages(-1, AllocFlags::empty()), None);
    assert_eq!(alloc.allocate_pages(LAST_ORDER + 1, AllocFlags::empty()), None);

    assert_eq!(free_lists(&alloc), before);
    assert_eq!(alloc.total_free(), 8);
}

#[test]
fn cascade_split_and_remerge() {
    let frames = 1u64 << LAST_ORDER;
    let mut region = Region::new(frames);
    let mut alloc = region.populated(0, frames);

    // The whole range arrives as a single top-order block.
    assert_eq!(free_lists(&alloc)[LAST_ORDER as usize], [0]);

    // A single-page allocation splits all the way down, leaving the upper
    // half of every split behind.
    let block = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
    assert_eq!(block.pfn(), Pfn::new(0));

    let lists = free_lists(&alloc);
    for order in 0..LAST_ORDER {
        assert_eq!(
            lists[order as usize],
            [1u64 << order],
            "expected exactly the upper half at order {}",
            order
        );
    }
    assert!(lists[LAST_ORDER as usize].is_empty());
    assert_eq!(alloc.total_free(), frames - 1);
    check_invariants(&alloc);

    // Freeing the page cascades the merges back into one top-order block.
    unsafe { alloc.free_pages(block, 0) };

    let lists = free_lists(&alloc);
    for order in 0..LAST_ORDER {
        assert!(lists[order as usize].is_empty());
    }
    assert_eq!(lists[LAST_ORDER as usize], [0]);
    assert_eq!(alloc.total_free(), frames);
    check_invariants(&alloc);
}

#[test]
fn unaligned_insert_splits_at_natural_boundaries() {
    let mut region = Region::new(7);
    let alloc = region.populated(3, 7);

    let lists = free_lists(&alloc);
    assert_eq!(lists[0], [3]);
    assert_eq!(lists[1], [8]);
    assert_eq!(lists[2], [4]);
    assert_eq!(alloc.total_free(), 7);
    check_invariants(&alloc);
}

#[test]
fn single_page_exhaustion() {
    let mut region = Region::new(1);
    let mut alloc = region.populated(0, 1);

    let first = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
    assert_eq!(first.pfn(), Pfn::new(0));
    assert_eq!(alloc.allocate_pages(0, AllocFlags::empty()), None);
    assert_eq!(alloc.total_free(), 0);
}

#[test]
fn range_beyond_top_order_becomes_top_blocks() {
    let top = 1u64 << LAST_ORDER;
    let mut region = Region::new(3 * top);
    let alloc = region.populated(0, 3 * top);

    let lists = free_lists(&alloc);
    assert_eq!(lists[LAST_ORDER as usize], [0, top, 2 * top]);
    for order in 0..LAST_ORDER {
        assert!(lists[order as usize].is_empty());
    }
    check_invariants(&alloc);
}

#[test]
fn zero_flag_scrubs_block() {
    let mut region = Region::new(4);
    region.fill(u64::MAX);
    let mut alloc = region.populated(0, 4);

    let block = alloc.allocate_pages(1, AllocFlags::ZERO).unwrap();
    let body = alloc.frame_table().body_ptr(block);
    let bytes = unsafe { slice::from_raw_parts(body.as_ptr(), 2 * PAGE_SIZE) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn round_trip_restores_free_lists() {
    let mut region = Region::new(256);
    let mut alloc = region.populated(0, 256);

    // Scramble the lists a little first.
    let a = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
    let b = alloc.allocate_pages(2, AllocFlags::empty()).unwrap();
    let before = free_lists(&alloc);

    let block = alloc.allocate_pages(3, AllocFlags::empty()).unwrap();
    unsafe { alloc.free_pages(block, 3) };

    assert_eq!(free_lists(&alloc), before);

    unsafe {
        alloc.free_pages(a, 0);
        alloc.free_pages(b, 2);
    }
    check_invariants(&alloc);
}

#[test]
fn buddies_coalesce_regardless_of_free_order() {
    let mut region = Region::new(4);

    for reversed in [false, true] {
        let mut alloc = region.populated(0, 4);

        let a = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
        let b = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
        assert_eq!(a.pfn(), Pfn::new(0));
        assert_eq!(b.pfn(), Pfn::new(1));

        let (first, second) = if reversed { (b, a) } else { (a, b) };
        unsafe {
            alloc.free_pages(first, 0);
            alloc.free_pages(second, 0);
        }

        let lists = free_lists(&alloc);
        assert!(lists[0].is_empty());
        assert!(lists[1].is_empty());
        assert_eq!(lists[2], [0]);
        check_invariants(&alloc);
    }
}

#[test]
fn adjacent_inserts_coalesce_across_the_seam() {
    let mut region = Region::new(4);
    let mut alloc = region.allocator(0, 4);
    let table = alloc.frame_table();
    let lower = table.get_from_pfn(Pfn::new(0));
    let upper = table.get_from_pfn(Pfn::new(2));

    unsafe {
        alloc.insert_free_pages(lower, 2);
        alloc.insert_free_pages(upper, 2);
    }

    assert_eq!(free_lists(&alloc)[2], [0]);
    check_invariants(&alloc);
}

#[test]
fn insert_of_zero_pages_is_a_noop() {
    let mut region = Region::new(4);
    let mut alloc = region.allocator(0, 4);
    let start = alloc.frame_table().get_from_pfn(Pfn::new(0));

    unsafe { alloc.insert_free_pages(start, 0) };

    assert!(free_lists(&alloc).iter().all(|list| list.is_empty()));
    assert_eq!(alloc.total_free(), 0);
}

#[test]
fn no_speculative_merging_on_demand() {
    // Three pages yield an order-1 and an order-0 block; together they could
    // cover an order-2 request, but the allocator only merges on free.
    let mut region = Region::new(3);
    let mut alloc = region.populated(0, 3);

    assert_eq!(alloc.allocate_pages(2, AllocFlags::empty()), None);

    let block = alloc.allocate_pages(1, AllocFlags::empty()).unwrap();
    assert_eq!(block.pfn(), Pfn::new(0));
}

#[test]
fn total_free_tracks_outstanding_blocks() {
    let mut region = Region::new(16);
    let mut alloc = region.populated(0, 16);
    assert_eq!(alloc.total_free(), 16);

    let a = alloc.allocate_pages(2, AllocFlags::empty()).unwrap();
    assert_eq!(alloc.total_free(), 12);

    let b = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
    assert_eq!(alloc.total_free(), 11);

    unsafe {
        alloc.free_pages(a, 2);
        alloc.free_pages(b, 0);
    }
    assert_eq!(alloc.total_free(), 16);
}

#[test]
fn dump_lists_block_extents() {
    let mut region = Region::new(4);
    let alloc = region.populated(0, 4);

    let rendered = alloc.dump().to_string();
    assert!(rendered.starts_with("*** buddy page allocator - free list ***"));
    // One order-2 block spanning four 16-byte pages.
    assert!(rendered.contains("[02] 0--3f"), "got:\n{}", rendered);
    assert_eq!(rendered.lines().count(), 1 + (LAST_ORDER as usize + 1));
}

#[test]
#[should_panic(expected = "already in order")]
fn double_free_panics() {
    let mut region = Region::new(1);
    let mut alloc = region.populated(0, 1);

    let block = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
    unsafe {
        alloc.free_pages(block, 0);
        alloc.free_pages(block, 0);
    }
}

#[test]
#[should_panic(expected = "misaligned for order")]
fn misaligned_free_panics() {
    let mut region = Region::new(4);
    let mut alloc = region.populated(0, 4);

    let _ = alloc.allocate_pages(1, AllocFlags::empty()).unwrap();
    let skewed = alloc.frame_table().get_from_pfn(Pfn::new(1));
    unsafe { alloc.free_pages(skewed, 1) };
}

#[test]
#[should_panic(expected = "out of range")]
fn out_of_range_free_panics() {
    let mut region = Region::new(1);
    let mut alloc = region.populated(0, 1);

    let block = alloc.allocate_pages(0, AllocFlags::empty()).unwrap();
    unsafe { alloc.free_pages(block, LAST_ORDER + 1) };
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of `2^order` pages.
    Allocate { order: i32 },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation order in property tests; the region has 2^10 frames.
const PROP_ORDER_LIMIT: u8 = 10;

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                order: (u8::arbitrary(g) % (PROP_ORDER_LIMIT + 1)) as i32,
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

#[test]
fn allocations_are_mutually_exclusive_and_invariants_hold() {
    const NUM_FRAMES: u64 = 1 << PROP_ORDER_LIMIT;

    struct Allocation {
        id: u32,
        block: Frame,
        order: i32,
    }

    fn block_words(order: i32) -> usize {
        (PAGE_SIZE << order) / mem::size_of::<u32>()
    }

    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let mut region = Region::new(NUM_FRAMES);
        let mut alloc = region.populated(0, NUM_FRAMES);
        let mut outstanding: Vec<Allocation> = Vec::new();

        for (id, op) in ops.into_iter().enumerate() {
            let id = id as u32;

            match op {
                AllocatorOp::Allocate { order } => {
                    let block = match alloc.allocate_pages(order, AllocFlags::empty()) {
                        Some(b) => b,
                        None => continue,
                    };

                    let body = alloc.frame_table().body_ptr(block).cast::<u32>();
                    unsafe {
                        let words = slice::from_raw_parts_mut(body.as_ptr(), block_words(order));
                        words.fill(id);
                    }

                    outstanding.push(Allocation { id, block, order });
                }

                AllocatorOp::Free { index } => {
                    if outstanding.is_empty() {
                        continue;
                    }

                    let a = outstanding.swap_remove(index % outstanding.len());

                    let body = alloc.frame_table().body_ptr(a.block).cast::<u32>();
                    unsafe {
                        let words = slice::from_raw_parts(body.as_ptr(), block_words(a.order));
                        if words.iter().any(|&w| w != a.id) {
                            return false;
                        }
                    }

                    unsafe { alloc.free_pages(a.block, a.order) };
                }
            }

            check_invariants(&alloc);

            // Free pages plus outstanding allocations must tile the whole
            // inserted range exactly.
            let allocated: u64 = outstanding.iter().map(|a| 1u64 << a.order).sum();
            assert_eq!(alloc.total_free() + allocated, NUM_FRAMES);

            let mut extents: Vec<(u64, u64)> = outstanding
                .iter()
                .map(|a| (a.block.pfn().get(), 1u64 << a.order))
                .collect();
            for order in 0..=LAST_ORDER {
                for block in alloc.free_blocks(order) {
                    extents.push((block.pfn().get(), 1u64 << order));
                }
            }
            extents.sort_unstable();

            let mut expected_start = 0;
            for (start, len) in extents {
                assert_eq!(start, expected_start, "gap or overlap at pfn {}", start);
                expected_start = start + len;
            }
            assert_eq!(expected_start, NUM_FRAMES);
        }

        true
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}
