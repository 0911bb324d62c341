#![cfg_attr(not(test), no_std)]

//! A zone-based memory allocator.
//!
//! Requests are routed into one of three size classes:
//!
//! - *tiny* (payload up to [`TINY_MAX`] bytes) and *small* (up to
//!   [`SMALL_MAX`] bytes) are served from pooled, page-aligned zones, each
//!   large enough for [`CHUNKS_PER_ZONE`] chunks of the class's maximum size.
//! - *large* requests get a dedicated mapping each, tracked in a single list.
//!
//! Inside a zone, chunks are packed back to back, so the chunk list is always
//! in address order. That makes splitting and merging neighbours a matter of
//! pointer arithmetic:
//!
//! ```text
//! +------+--------+---------+--------+---------+--------+---------+ - - - -
//! | Zone | Header | Payload | Header | Payload | Header | Payload |  unused
//! +------+--------+---------+--------+---------+--------+---------+ - - - -
//!        |    live chunk    |    free chunk    |    live chunk    |
//! ```
//!
//! The main type is [`RawAlloc`](allocators/struct.RawAlloc.html), which is
//! generic over where its pages come from (a [`PageSource`]). For use as a
//! global allocator, see [`UnixAllocator`].

pub mod allocators;
pub mod api;
pub mod chunk;
pub mod error;
pub mod pages;
pub mod report;
#[cfg(not(feature = "use_libc"))]
pub mod unix;
pub mod zone;

pub use allocators::{RawAlloc, UnixAllocator};
pub use error::Error;
pub use pages::PageSource;

use static_assertions::const_assert;

/// Every payload pointer and every payload size is a multiple of this.
///
/// This matches the alignment of the widest scalar type on the platforms we
/// care about.
pub const ALIGN: usize = 16;

/// Largest payload served from a tiny zone.
pub const TINY_MAX: usize = 128;

/// Largest payload served from a small zone. Anything bigger gets its own
/// mapping.
pub const SMALL_MAX: usize = 4096;

/// Tiny and small zones are sized to hold this many chunks of their class's
/// maximum size.
pub const CHUNKS_PER_ZONE: usize = 128;

const_assert!(ALIGN.is_power_of_two());
const_assert!(TINY_MAX % ALIGN == 0);
const_assert!(SMALL_MAX % ALIGN == 0);
const_assert!(TINY_MAX < SMALL_MAX);

/// Round `value` up to the nearest multiple of `increment`.
///
/// Returns `None` if the result does not fit in a `usize`.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

/// Round a requested byte count up to [`ALIGN`].
///
/// Returns `None` if that would overflow.
pub fn align_up(size: usize) -> Option<usize> {
    size.checked_add(ALIGN - 1).map(|s| s & !(ALIGN - 1))
}

/// The three size bands requests are routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Tiny,
    Small,
    Large,
}

impl SizeClass {
    /// Classify an (already aligned) payload size.
    pub fn of(size: usize) -> SizeClass {
        if size <= TINY_MAX {
            SizeClass::Tiny
        } else if size <= SMALL_MAX {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    /// The biggest payload a pooled class hands out, or `None` for large.
    pub fn max_payload(self) -> Option<usize> {
        match self {
            SizeClass::Tiny => Some(TINY_MAX),
            SizeClass::Small => Some(SMALL_MAX),
            SizeClass::Large => None,
        }
    }

    /// The label used in memory dumps.
    pub fn label(self) -> &'static str {
        match self {
            SizeClass::Tiny => "TINY",
            SizeClass::Small => "SMALL",
            SizeClass::Large => "LARGE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(16));
        assert_eq!(align_up(12), Some(16));
        assert_eq!(align_up(16), Some(16));
        assert_eq!(align_up(48), Some(48));
        assert_eq!(align_up(4097), Some(4112));
        assert_eq!(align_up(usize::MAX), None);
    }

    #[test]
    fn test_size_class_boundaries() {
        assert_eq!(SizeClass::of(0), SizeClass::Tiny);
        assert_eq!(SizeClass::of(128), SizeClass::Tiny);
        assert_eq!(SizeClass::of(144), SizeClass::Small);
        assert_eq!(SizeClass::of(4096), SizeClass::Small);
        assert_eq!(SizeClass::of(align_up(4097).unwrap()), SizeClass::Large);
        assert_eq!(SizeClass::Large.max_payload(), None);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), Some(0));
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(usize::MAX - 4096, 4096), Some(usize::MAX - 4095));
        assert_eq!(round_up(usize::MAX - 100, 4096), None);
    }
}
