#![doc = include_str!("../README.md")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
// This is necessary to allow `sptr` to shadow methods provided by unstable
// features.
#![allow(unstable_name_collisions)]

pub mod buddy;
pub mod frame;

pub(crate) mod polyfill;

#[cfg(test)]
mod tests;

#[doc(inline)]
pub use crate::{
    buddy::{AllocFlags, BuddyPageAllocator, LAST_ORDER},
    frame::{Frame, FrameTable, Pfn},
};

/// The error type for frame table constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameTableError {
    /// The configuration of the table is invalid.
    ///
    /// This variant is returned when the table's parameters are impossible to
    /// satisfy, e.g. a page size too small to hold the intrusive free-list
    /// link, or a table of zero frames.
    InvalidConfig,

    /// The location of the managed region is invalid.
    ///
    /// This variant is returned when the full span of the region would not
    /// fit at the provided address or frame number, i.e., pointer or frame
    /// calculations would overflow.
    InvalidLocation,
}
