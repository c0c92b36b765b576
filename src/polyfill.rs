//! Stable polyfills for the strict-provenance pointer methods.
//!
//! Raw-pointer shims come from the `sptr` crate; this module adds the
//! `NonNull` equivalent, implemented more-or-less verbatim from the standard
//! library source.

use core::{num::NonZeroUsize, ptr::NonNull};

use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }
}
