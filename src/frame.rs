//! The page-frame registry: frame numbers, frame handles, and the table that
//! maps them onto backing memory.
//!
//! A [`FrameTable`] owns the provenance of one contiguous region of memory
//! holding the bodies of a run of page frames. Every pointer into the region
//! is derived from the table's base pointer; the intrusive free-list metadata
//! stores frame numbers, never pointers, so no borrow of a page body outlives
//! the accessor that produced it.

use core::{fmt, mem, ptr::NonNull};

use crate::{polyfill::NonNullStrict, FrameTableError};

/// A page frame number: the identity of one physical page frame.
///
/// The physical base address of a frame is its PFN shifted left by the page
/// size exponent.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Pfn(u64);

impl Pfn {
    /// Creates a `Pfn` from a raw frame number.
    #[inline]
    pub const fn new(raw: u64) -> Pfn {
        Pfn(raw)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An opaque handle to one page frame.
///
/// Handles are only produced by [`FrameTable::get_from_pfn`], so holding one
/// proves the frame lies inside the table that issued it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pfn: Pfn,
}

impl Frame {
    /// Returns the frame's page frame number.
    #[inline]
    pub fn pfn(self) -> Pfn {
        self.pfn
    }
}

// Rather than pointers, the links store only the frame numbers of their
// successors. This avoids accidentally violating stacked borrows; a link
// "points to" the next free block, but by forgoing an actual pointer, no
// borrow is implied.
//
// NOTE: Using this method, any actual pointer to a page body must be acquired
// via the frame table, and NOT by casting a stored frame number!

/// The metadata held in the body of a free block's head page.
///
/// This type is meant to be embedded in the page itself, forming an intrusive
/// linked list. It must never be read from a page the allocator does not own.
#[repr(C)]
pub(crate) struct FreeLink {
    /// The next free block head at the same order, or `None` at the tail.
    pub next: Option<Pfn>,
}

/// A table of page frames backed by one contiguous region of memory.
///
/// The table covers frames `[first_pfn, first_pfn + num_frames)`; frame
/// bodies are laid out consecutively from `base`, each `2^PAGE_BITS` bytes
/// long. `PAGE_BITS` is the page size exponent, so a frame's physical base
/// address is `pfn << PAGE_BITS`.
#[derive(Debug)]
pub struct FrameTable<const PAGE_BITS: u32> {
    /// Pointer to the body of the first frame. All page-body pointers carry
    /// this pointer's provenance.
    base: NonNull<u8>,
    first_pfn: Pfn,
    num_frames: u64,
}

impl<const PAGE_BITS: u32> FrameTable<PAGE_BITS> {
    /// The size in bytes of one page frame.
    pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

    /// Constructs a new `FrameTable` over a raw region.
    ///
    /// # Errors
    ///
    /// Returns [`FrameTableError::InvalidConfig`] if `num_frames` is zero or
    /// the page size cannot hold the free-list metadata, and
    /// [`FrameTableError::InvalidLocation`] if `base` is misaligned for that
    /// metadata or any address computation over the region would overflow.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `base` must be valid for reads and writes for
    ///   `num_frames * 2^PAGE_BITS` bytes.
    /// - The region must not be accessed except through this table (and, for
    ///   allocated blocks, through pointers returned by [`Self::body_ptr`])
    ///   for as long as the table or any allocator built on it exists.
    pub unsafe fn new(
        base: NonNull<u8>,
        first_pfn: Pfn,
        num_frames: u64,
    ) -> Result<FrameTable<PAGE_BITS>, FrameTableError> {
        if num_frames == 0 || Self::PAGE_SIZE < mem::size_of::<FreeLink>() {
            return Err(FrameTableError::InvalidConfig);
        }

        if base.addr().get() % mem::align_of::<FreeLink>() != 0 {
            return Err(FrameTableError::InvalidLocation);
        }

        // Neither the PFN range nor any address computed over the region may
        // wrap.
        let limit = first_pfn
            .get()
            .checked_add(num_frames)
            .ok_or(FrameTableError::InvalidLocation)?;
        limit
            .checked_mul(Self::PAGE_SIZE as u64)
            .ok_or(FrameTableError::InvalidLocation)?;

        let span = usize::try_from(num_frames)
            .ok()
            .and_then(|n| n.checked_mul(Self::PAGE_SIZE))
            .ok_or(FrameTableError::InvalidLocation)?;
        base.addr()
            .get()
            .checked_add(span)
            .ok_or(FrameTableError::InvalidLocation)?;

        Ok(FrameTable {
            base,
            first_pfn,
            num_frames,
        })
    }

    /// Returns the first frame number covered by the table.
    #[inline]
    pub fn first_pfn(&self) -> Pfn {
        self.first_pfn
    }

    /// Returns the number of frames covered by the table.
    #[inline]
    pub fn num_frames(&self) -> u64 {
        self.num_frames
    }

    /// Returns `true` if `pfn` lies within the table.
    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.first_pfn && pfn.get() - self.first_pfn.get() < self.num_frames
    }

    /// Looks up the frame with the given frame number.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` lies outside the table.
    #[inline]
    pub fn get_from_pfn(&self, pfn: Pfn) -> Frame {
        assert!(self.contains(pfn), "pfn {} outside the frame table", pfn);

        Frame { pfn }
    }

    /// Returns the physical base address of `frame`.
    #[inline]
    pub fn base_address(&self, frame: Frame) -> u64 {
        frame.pfn().get() << PAGE_BITS
    }

    /// Returns a writable pointer to the body of `frame`.
    ///
    /// The returned pointer has the provenance of the table's base pointer.
    /// While the frame is free its body belongs to the allocator; callers may
    /// only write through this pointer for frames they have allocated.
    #[inline]
    pub fn body_ptr(&self, frame: Frame) -> NonNull<u8> {
        debug_assert!(self.contains(frame.pfn()));

        let index = frame.pfn().get() - self.first_pfn.get();
        let ofs = usize::try_from(index).expect("frame index overflows usize") * Self::PAGE_SIZE;

        // SAFETY: the constructor checked that every frame body lies within
        // the region, so the offset stays in bounds and cannot wrap.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(ofs)) }
    }

    /// Initializes a `FreeLink` in the body of `frame`.
    ///
    /// This is a write-only operation: the previous contents of the page are
    /// never read, so it can claim a page whose body was caller-owned until
    /// now.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The body of `frame` must be unallocated, i.e. owned by the
    ///   allocator.
    /// - No reference to the frame's previous link (if any) may be live.
    #[inline]
    pub(crate) unsafe fn init_link_at(&self, frame: Frame, link: FreeLink) {
        unsafe { self.body_ptr(frame).cast::<FreeLink>().as_ptr().write(link) };
    }

    /// Returns a mutable reference to the `FreeLink` in the body of `frame`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The body of `frame` must hold a properly initialized `FreeLink`,
    ///   i.e. the frame must be the head of a block on some free list.
    /// - The reference must be dropped before any other access to the page
    ///   body is made.
    #[inline]
    pub(crate) unsafe fn link_mut<'a>(&self, frame: Frame) -> &'a mut FreeLink {
        unsafe { self.body_ptr(frame).cast::<FreeLink>().as_mut() }
    }
}
