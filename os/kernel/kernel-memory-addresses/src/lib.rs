//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page frame numbers
//! used by the region tracker, the page allocators and the paging code.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory or an MMIO window. |
//! | [`VirtualAddress`] | A byte address in the (page-table translated) virtual space. |
//! | [`PageFrameNumber`] | A physical address divided by [`PAGE_SIZE`]. |
//!
//! The types are zero-cost `#[repr(transparent)]` wrappers around `u64` and
//! exist only to keep the two address spaces from being mixed by accident.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0020_1234);
//! assert_eq!(pa.page_base().as_u64(), 0x0020_1000);
//! assert_eq!(pa.page_offset(), 0x234);
//!
//! let pfn = PageFrameNumber::containing(pa);
//! assert_eq!(pfn.as_u64(), 0x201);
//! assert_eq!(pfn.buddy(0).as_u64(), 0x200);
//! ```
//!
//! ## Alignment helpers
//!
//! [`align_down`] and [`align_up`] work on any power-of-two alignment.
//! [`checked_align_up`] reports overflow instead of wrapping, which matters
//! when aligning addresses close to the top of the 64-bit range.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod page_frame;
mod physical_address;
mod virtual_address;

pub use page_frame::PageFrameNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow;
/// use [`checked_align_up`] when `x` may be near `u64::MAX`.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Like [`align_up`], but returns `None` instead of wrapping past `u64::MAX`.
///
/// ```rust
/// # use kernel_memory_addresses::checked_align_up;
/// assert_eq!(checked_align_up(0x1001, 0x1000), Some(0x2000));
/// assert_eq!(checked_align_up(u64::MAX - 1, 0x1000), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Returns `true` if `x` is a multiple of the power-of-two `a`.
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_align_up_saturates_at_top_of_range() {
        assert_eq!(checked_align_up(u64::MAX & !0xfff, 0x1000), Some(u64::MAX & !0xfff));
        assert_eq!(checked_align_up((u64::MAX & !0xfff) + 1, 0x1000), None);
    }

    #[test]
    fn alignment_predicates() {
        assert!(is_aligned(0x20_0000, PAGE_SIZE));
        assert!(!is_aligned(0x20_0010, PAGE_SIZE));
        assert!(is_aligned(0, 1));
    }
}
