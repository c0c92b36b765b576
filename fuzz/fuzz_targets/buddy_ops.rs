#![no_main]

use std::ptr::NonNull;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use pfalloc::{AllocFlags, BuddyPageAllocator, Frame, FrameTable, Pfn, LAST_ORDER};

const PAGE_BITS: u32 = 4;
const PAGE_SIZE: usize = 1 << PAGE_BITS;

const MAX_FRAMES: u64 = 1 << 12;

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    Allocate { order: i8, zero: bool },
    Free { index: usize },
}

#[derive(Debug, Arbitrary)]
struct Args {
    first_pfn: u16,
    num_frames: u16,
    ops: Vec<Op>,
}

fn check_free_lists(alloc: &BuddyPageAllocator<PAGE_BITS>) {
    for order in 0..=LAST_ORDER {
        let pages = 1u64 << order;
        let mut prev: Option<u64> = None;

        for block in alloc.free_blocks(order) {
            let pfn = block.pfn().get();
            assert_eq!(pfn % pages, 0, "misaligned block at order {}", order);

            if let Some(prev) = prev {
                assert!(prev < pfn, "order {} list not ascending", order);
                if order < LAST_ORDER {
                    assert_ne!(prev ^ pages, pfn, "unmerged buddies at order {}", order);
                }
            }
            prev = Some(pfn);
        }
    }
}

fuzz_target!(|args: Args| {
    let num_frames = u64::from(args.num_frames) % MAX_FRAMES;
    if num_frames == 0 {
        return;
    }

    let mut region = vec![0u64; num_frames as usize * PAGE_SIZE / 8];
    let base = NonNull::new(region.as_mut_ptr().cast::<u8>()).unwrap();

    let first_pfn = Pfn::new(u64::from(args.first_pfn));
    let table = match unsafe { FrameTable::<PAGE_BITS>::new(base, first_pfn, num_frames) } {
        Ok(t) => t,
        Err(_) => return,
    };

    let start = table.get_from_pfn(first_pfn);
    let mut alloc = BuddyPageAllocator::new(table);
    unsafe { alloc.insert_free_pages(start, num_frames) };
    check_free_lists(&alloc);

    let mut outstanding: Vec<(Frame, i32)> = Vec::new();
    for op in args.ops {
        match op {
            Op::Allocate { order, zero } => {
                let flags = if zero {
                    AllocFlags::ZERO
                } else {
                    AllocFlags::empty()
                };

                if let Some(block) = alloc.allocate_pages(order.into(), flags) {
                    outstanding.push((block, order.into()));
                }
            }

            Op::Free { index } => {
                if outstanding.is_empty() {
                    continue;
                }

                let (block, order) = outstanding.swap_remove(index % outstanding.len());
                unsafe { alloc.free_pages(block, order) };
            }
        }

        check_free_lists(&alloc);
    }

    let allocated: u64 = outstanding.iter().map(|&(_, order)| 1u64 << order).sum();
    assert_eq!(alloc.total_free() + allocated, num_frames);
});
