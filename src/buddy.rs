//! Binary-buddy allocation of page frames.
//!
//! Frames are grouped into power-of-two blocks of 2<sup>order</sup> pages,
//! for orders 0 through [`LAST_ORDER`]. An order-*n* block always starts at a
//! frame number divisible by 2<sup>n</sup>, so the buddy of a block is found
//! by toggling bit *n* of its frame number. Whenever a block is freed and its
//! buddy is also free at the same order, the pair is merged into one block of
//! the next order up; the allocator never holds two free buddies apart.
//!
//! One singly-linked free list is kept per order, sorted by ascending frame
//! number and stored intrusively in the first words of the free pages. The
//! sort costs O(list) on insertion but pays for itself on every free: two
//! free buddies are always neighbors in their list, so the merge check is a
//! single link read. Splitting and merging are both iterative; nothing here
//! recurses, and nothing here allocates.

use core::{fmt, ptr};

use bitflags::bitflags;

use crate::frame::{Frame, FrameTable, FreeLink, Pfn};

/// The largest supported block order; an order-`LAST_ORDER` block spans
/// 2<sup>16</sup> pages.
pub const LAST_ORDER: i32 = 16;

const ORDER_COUNT: usize = LAST_ORDER as usize + 1;

bitflags! {
    /// Options for [`BuddyPageAllocator::allocate_pages`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero-fill the entire block body before returning it.
        const ZERO = 1;
    }
}

/// A position in one order's free list that a block link can be written to:
/// either the list head itself, or the link embedded in a predecessor block.
///
/// This stands in for the pointer-to-pointer walk a doubly-indirect list
/// would use; resolving the slot through the allocator keeps all page-body
/// accesses funneled through the frame table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Slot {
    /// The head entry for the order with this index.
    Head(usize),
    /// The link inside the block whose head has this frame number.
    Link(Pfn),
}

/// A binary-buddy allocator over a table of page frames.
///
/// The allocator is single-threaded; callers serialize access around it. See
/// the crate-level documentation for the ownership handoff rules.
#[derive(Debug)]
pub struct BuddyPageAllocator<const PAGE_BITS: u32> {
    frames: FrameTable<PAGE_BITS>,
    /// Heads of the per-order free lists, sorted by ascending PFN.
    free_list: [Option<Pfn>; ORDER_COUNT],
    /// Total pages currently on the free lists.
    total_free: u64,
}

impl<const PAGE_BITS: u32> BuddyPageAllocator<PAGE_BITS> {
    /// Creates an empty allocator over `frames`.
    ///
    /// The allocator starts with nothing to hand out; populate it with
    /// [`Self::insert_free_pages`].
    pub fn new(frames: FrameTable<PAGE_BITS>) -> BuddyPageAllocator<PAGE_BITS> {
        BuddyPageAllocator {
            frames,
            free_list: [None; ORDER_COUNT],
            total_free: 0,
        }
    }

    /// Returns the frame table backing this allocator.
    #[inline]
    pub fn frame_table(&self) -> &FrameTable<PAGE_BITS> {
        &self.frames
    }

    /// Returns the number of pages currently free at all orders.
    #[inline]
    pub fn total_free(&self) -> u64 {
        self.total_free
    }

    /// The number of pages in an order-`order` block.
    #[inline]
    const fn pages_per_block(order: i32) -> u64 {
        1 << order
    }

    /// Whether `pfn` can head a block of the given order.
    #[inline]
    const fn block_aligned(order: i32, pfn: Pfn) -> bool {
        pfn.get() & (Self::pages_per_block(order) - 1) == 0
    }

    /// The buddy of the order-`order` block headed by `pfn`.
    #[inline]
    const fn buddy_pfn(order: i32, pfn: Pfn) -> Pfn {
        Pfn::new(pfn.get() ^ Self::pages_per_block(order))
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Allocates a block of `2^order` pages, returning its head frame.
    ///
    /// If no block of the requested order is free, a larger block is split
    /// down until one is. Returns `None` if `order` is out of range or no
    /// free block of any order `>= order` exists; the allocator never merges
    /// speculatively to satisfy a request.
    ///
    /// With [`AllocFlags::ZERO`], the whole block body is zero-filled before
    /// it is returned. Otherwise its contents are unspecified; free pages
    /// carry allocator metadata.
    pub fn allocate_pages(&mut self, order: i32, flags: AllocFlags) -> Option<Frame> {
        if !(0..=LAST_ORDER).contains(&order) {
            return None;
        }

        let chosen = self.iterative_split(order)?;
        self.remove_free_block(order, chosen);

        if flags.contains(AllocFlags::ZERO) {
            let bytes: usize = (Self::pages_per_block(order) << PAGE_BITS)
                .try_into()
                .expect("block byte length overflows usize");

            // SAFETY: the block was just taken off the free lists, so until
            // it is returned the allocator has exclusive access to its body.
            unsafe { ptr::write_bytes(self.frames.body_ptr(chosen).as_ptr(), 0, bytes) };
        }

        Some(chosen)
    }

    /// Returns a block of `2^order` pages to the allocator.
    ///
    /// The block is inserted at `order` and then merged upward for as long as
    /// its buddy is also free at the same order.
    ///
    /// # Panics
    ///
    /// Panics if `order` is out of range, if `block` is misaligned for
    /// `order`, or if the block is already free (double free).
    ///
    /// # Safety
    ///
    /// `block` must be the head of a block of exactly `2^order` pages that
    /// the caller owns: either one returned by [`Self::allocate_pages`] with
    /// the same order, or pages never yet inserted. The caller must not touch
    /// the block body after this call.
    pub unsafe fn free_pages(&mut self, block: Frame, order: i32) {
        assert!(
            (0..=LAST_ORDER).contains(&order),
            "freed order {} out of range",
            order
        );

        self.insert_free_block(order, block);
        self.iterative_merge(order, block);
    }

    /// Hands a contiguous run of `page_count` free pages to the allocator.
    ///
    /// The range need not be aligned or power-of-two sized; it is carved into
    /// the largest naturally-aligned blocks that fit. Inserting zero pages is
    /// a no-op. Intended for initialization, but safe to call at any time,
    /// and runs inserted later coalesce with what is already free.
    ///
    /// # Panics
    ///
    /// Panics if the range wraps the PFN space or leaves the frame table.
    ///
    /// # Safety
    ///
    /// The caller must own all `page_count` pages starting at `range_start`,
    /// none of which may already be in the allocator, and must not touch
    /// their bodies after this call.
    pub unsafe fn insert_free_pages(&mut self, range_start: Frame, page_count: u64) {
        let mut pfn = range_start.pfn().get();
        let mut page_count = page_count;

        assert!(
            pfn.checked_add(page_count).is_some(),
            "page range wraps the PFN space"
        );

        // Work up from order 0, peeling one block per set low bit of the
        // start PFN. Each peeled block raises the alignment of what remains,
        // so this terminates with `pfn` aligned to LAST_ORDER or the range
        // exhausted. Freeing (rather than raw-inserting) lets each block
        // merge with neighbors inserted earlier.
        let mut lsb: u64 = 1;
        let mut order: i32 = 0;
        while page_count >= lsb && order < LAST_ORDER {
            if pfn & lsb != 0 {
                let block = self.frames.get_from_pfn(Pfn::new(pfn));
                unsafe { self.free_pages(block, order) };
                page_count -= lsb;
                pfn += lsb;
            }

            lsb <<= 1;
            order += 1;
        }

        // Whole top-order blocks go in raw; there is no larger order for
        // them to merge into.
        let top = Self::pages_per_block(LAST_ORDER);
        while page_count >= top {
            let block = self.frames.get_from_pfn(Pfn::new(pfn));
            self.insert_free_block(LAST_ORDER, block);
            page_count -= top;
            pfn += top;
        }

        // Less than one top-order block remains. Step the order back down,
        // emitting one block per set bit of the remaining count.
        while lsb > 1 {
            lsb >>= 1;
            order -= 1;
            if page_count & lsb != 0 {
                let block = self.frames.get_from_pfn(Pfn::new(pfn));
                unsafe { self.free_pages(block, order) };
                pfn += lsb;
            }
        }
    }

    /// Returns an iterator over the free block heads at `order`, in
    /// ascending PFN order.
    ///
    /// # Panics
    ///
    /// Panics if `order` is out of range.
    pub fn free_blocks(&self, order: i32) -> FreeBlocks<'_, PAGE_BITS> {
        assert!(
            (0..=LAST_ORDER).contains(&order),
            "order {} out of range",
            order
        );

        FreeBlocks {
            alloc: self,
            cur: self.free_list[order as usize],
        }
    }

    /// Renders the free lists for diagnostics.
    ///
    /// The returned value implements [`fmt::Display`], emitting one line per
    /// order with the physical extents of every free block at that order.
    pub fn dump(&self) -> FreeListDump<'_, PAGE_BITS> {
        FreeListDump { alloc: self }
    }

    // ------------------------------------------------------------------
    // Free-list management
    // ------------------------------------------------------------------

    /// Reads the link of a block that is on a free list.
    #[inline]
    fn next_free(&self, block: Frame) -> Option<Pfn> {
        // SAFETY: blocks reachable from the free lists always hold an
        // initialized link.
        unsafe { self.frames.link_mut(block).next }
    }

    /// Rewrites the link of a block that is on a free list.
    #[inline]
    fn set_next_free(&mut self, block: Frame, next: Option<Pfn>) {
        // SAFETY: as for next_free; `&mut self` keeps the reference unique.
        unsafe { self.frames.link_mut(block).next = next };
    }

    /// Reads the successor stored at `slot`.
    fn slot_next(&self, slot: Slot) -> Option<Pfn> {
        match slot {
            Slot::Head(index) => self.free_list[index],
            Slot::Link(pfn) => self.next_free(self.frames.get_from_pfn(pfn)),
        }
    }

    /// Stores a new successor at `slot`.
    fn set_slot_next(&mut self, slot: Slot, next: Option<Pfn>) {
        match slot {
            Slot::Head(index) => self.free_list[index] = next,
            Slot::Link(pfn) => {
                let pred = self.frames.get_from_pfn(pfn);
                self.set_next_free(pred, next);
            }
        }
    }

    /// Finds the slot where `block` belongs in the order's sorted list.
    ///
    /// Panics if the block is already present (double insert).
    fn get_slot(&self, order: i32, block: Pfn) -> Slot {
        assert!(
            (0..=LAST_ORDER).contains(&order),
            "order {} out of range",
            order
        );
        assert!(
            Self::block_aligned(order, block),
            "pfn {} misaligned for order {}",
            block,
            order
        );

        let mut slot = Slot::Head(order as usize);
        while let Some(next) = self.slot_next(slot) {
            if next >= block {
                break;
            }
            slot = Slot::Link(next);
        }

        assert!(
            self.slot_next(slot) != Some(block),
            "block {} already in order {} free list",
            block,
            order
        );

        slot
    }

    /// Finds the slot whose successor is `block`, for unlinking it.
    ///
    /// Panics if the block is not present (remove of a missing block).
    fn get_candidate_slot(&self, order: i32, block: Pfn) -> Slot {
        assert!(
            (0..=LAST_ORDER).contains(&order),
            "order {} out of range",
            order
        );
        assert!(
            Self::block_aligned(order, block),
            "pfn {} misaligned for order {}",
            block,
            order
        );

        let mut slot = Slot::Head(order as usize);
        loop {
            match self.slot_next(slot) {
                Some(next) if next == block => return slot,
                Some(next) => slot = Slot::Link(next),
                None => panic!("block {} missing from order {} free list", block, order),
            }
        }
    }

    /// Links one block into the order's free list.
    fn insert_free_block(&mut self, order: i32, block: Frame) {
        let slot = self.get_slot(order, block.pfn());
        let next = self.slot_next(slot);

        // SAFETY: the block is being claimed for the free list; its body is
        // allocator-owned from here on, and the write does not read whatever
        // the caller left behind.
        unsafe { self.frames.init_link_at(block, FreeLink { next }) };
        self.set_slot_next(slot, Some(block.pfn()));

        self.total_free += Self::pages_per_block(order);
    }

    /// Unlinks one block from the order's free list.
    fn remove_free_block(&mut self, order: i32, block: Frame) {
        let slot = self.get_candidate_slot(order, block.pfn());
        let next = self.next_free(block);

        self.set_slot_next(slot, next);
        self.set_next_free(block, None);

        self.total_free -= Self::pages_per_block(order);
    }

    /// Links two adjacent buddies into the order's free list in one pass.
    ///
    /// `first` must have the lower PFN of the pair.
    fn insert_buddies(&mut self, order: i32, first: Frame, second: Frame) {
        let slot = self.get_slot(order, first.pfn());
        assert!(
            Self::block_aligned(order, second.pfn()),
            "pfn {} misaligned for order {}",
            second.pfn(),
            order
        );

        let next = self.slot_next(slot);

        // SAFETY: both halves come from a block the allocator owns; the
        // writes are the claiming writes for their new order.
        unsafe {
            self.frames.init_link_at(second, FreeLink { next });
            self.frames.init_link_at(
                first,
                FreeLink {
                    next: Some(second.pfn()),
                },
            );
        }
        self.set_slot_next(slot, Some(first.pfn()));

        self.total_free += 2 * Self::pages_per_block(order);
    }

    /// Unlinks a pair of adjacent buddies, given the lower one.
    fn remove_buddies(&mut self, order: i32, first: Frame) {
        let slot = self.get_candidate_slot(order, first.pfn());

        let second_pfn = self
            .next_free(first)
            .expect("lower buddy has no successor in free list");
        assert!(
            Self::block_aligned(order, second_pfn),
            "pfn {} misaligned for order {}",
            second_pfn,
            order
        );

        let second = self.frames.get_from_pfn(second_pfn);
        let next = self.next_free(second);

        self.set_slot_next(slot, next);
        self.set_next_free(second, None);
        self.set_next_free(first, None);

        self.total_free -= 2 * Self::pages_per_block(order);
    }

    // ------------------------------------------------------------------
    // Split/merge engine
    // ------------------------------------------------------------------

    /// Splits one free block into its two order-`order - 1` halves.
    fn split_block(&mut self, order: i32, block: Frame) {
        assert!(
            order > 0 && order <= LAST_ORDER,
            "cannot split order {}",
            order
        );

        let half = Self::pages_per_block(order - 1);
        let upper = self
            .frames
            .get_from_pfn(Pfn::new(block.pfn().get() + half));

        self.remove_free_block(order, block);
        self.insert_buddies(order - 1, block, upper);
    }

    /// Merges `block` with its buddy if both are free at `order`.
    ///
    /// On success the pair moves to order `order + 1` and the lower head is
    /// returned; otherwise returns `None`.
    fn merge_buddies(&mut self, order: i32, block: Frame) -> Option<Frame> {
        assert!(
            (0..LAST_ORDER).contains(&order),
            "cannot merge order {}",
            order
        );

        let buddy = Self::buddy_pfn(order, block.pfn());
        if !self.frames.contains(buddy) {
            // A buddy outside the managed range can never have been freed.
            return None;
        }

        // The lists are sorted, so a free buddy pair is always adjacent in
        // its list. When `block` is the lower half its own link gives the
        // answer. When it is the upper half, check its list predecessor:
        // the lower buddy's body must not be read before it is known to be
        // free, because an allocated page belongs to its caller.
        let adjacent = if block.pfn() < buddy {
            self.next_free(block) == Some(buddy)
        } else {
            self.get_candidate_slot(order, block.pfn()) == Slot::Link(buddy)
        };
        if !adjacent {
            return None;
        }

        let first = self.frames.get_from_pfn(block.pfn().min(buddy));
        self.remove_buddies(order, first);
        self.insert_free_block(order + 1, first);

        Some(first)
    }

    /// Produces a free block at `target_order`, splitting larger blocks as
    /// needed. Returns the head of the target order's list, or `None` if no
    /// order at or above the target has anything free.
    fn iterative_split(&mut self, target_order: i32) -> Option<Frame> {
        assert!(
            (0..=LAST_ORDER).contains(&target_order),
            "order {} out of range",
            target_order
        );

        if let Some(head) = self.free_list[target_order as usize] {
            return Some(self.frames.get_from_pfn(head));
        }

        // Scan upward for the smallest order with a free block.
        let mut order = target_order + 1;
        while order <= LAST_ORDER && self.free_list[order as usize].is_none() {
            order += 1;
        }
        if order > LAST_ORDER {
            return None;
        }

        // Split one order at a time; each split leaves the lower half at the
        // head of the next list down.
        while order > target_order {
            let head = self.free_list[order as usize].expect("split emptied a scanned order");
            let head = self.frames.get_from_pfn(head);
            self.split_block(order, head);
            order -= 1;
        }

        self.free_list[target_order as usize]
            .map(|pfn| self.frames.get_from_pfn(pfn))
    }

    /// Merges `block` upward until its buddy is no longer free or the top
    /// order is reached.
    fn iterative_merge(&mut self, mut order: i32, mut block: Frame) {
        while order < LAST_ORDER {
            match self.merge_buddies(order, block) {
                Some(parent) => block = parent,
                None => break,
            }
            order += 1;
        }
    }
}

/// Iterator over the free block heads at one order. See
/// [`BuddyPageAllocator::free_blocks`].
#[derive(Debug)]
pub struct FreeBlocks<'a, const PAGE_BITS: u32> {
    alloc: &'a BuddyPageAllocator<PAGE_BITS>,
    cur: Option<Pfn>,
}

impl<const PAGE_BITS: u32> Iterator for FreeBlocks<'_, PAGE_BITS> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let frame = self.alloc.frames.get_from_pfn(self.cur.take()?);
        self.cur = self.alloc.next_free(frame);
        Some(frame)
    }
}

/// Displayable rendering of an allocator's free lists. See
/// [`BuddyPageAllocator::dump`].
#[derive(Debug)]
pub struct FreeListDump<'a, const PAGE_BITS: u32> {
    alloc: &'a BuddyPageAllocator<PAGE_BITS>,
}

impl<const PAGE_BITS: u32> fmt::Display for FreeListDump<'_, PAGE_BITS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "*** buddy page allocator - free list ***")?;

        for order in 0..=LAST_ORDER {
            write!(f, "[{:02}] ", order)?;

            for block in self.alloc.free_blocks(order) {
                let base = self.alloc.frames.base_address(block);
                let len = BuddyPageAllocator::<PAGE_BITS>::pages_per_block(order) << PAGE_BITS;
                write!(f, "{:x}--{:x} ", base, base + len - 1)?;
            }

            writeln!(f)?;
        }

        Ok(())
    }
}
