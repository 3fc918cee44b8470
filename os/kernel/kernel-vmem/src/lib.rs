//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's own address space.
//!
//! ## What you get
//! - An [`AddressSpace`] rooted at a top-level table, with range mapping,
//!   unmapping and translation.
//! - A [`PageTableEntry`] bitfield and a 4 KiB-aligned [`PageTable`].
//! - Architecture-neutral [`MapFlags`] that the address space turns into
//!   entry bits (honoring whether `NX` is available).
//! - The two seams the walker needs: [`FrameAlloc`] for fresh table frames
//!   and [`PhysMapper`] for touching physical memory.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//! ```
//!
//! The index into the level-`n` table is
//! `(va >> (12 + (n - 1) * 9)) & 0x1ff`, see [`table_index`].
//!
//! ```text
//!  L4  →  L3  →  L2  →  L1  →  Physical Page
//!                 │       └───► leaf: maps 4 KiB
//!                 └───────────► PS=1: maps 2 MiB (boot tables only)
//! ```
//!
//! Intermediate entries are created present and writable (and user-accessible
//! for user spaces); the leaf entry alone decides the final permissions. The
//! walk is a loop over the table height, never recursion.

#![cfg_attr(not(any(test, doctest, feature = "sim")), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod entry;
mod flags;
mod table;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, MapError, PagingFeatures};
pub use crate::entry::PageTableEntry;
pub use crate::flags::MapFlags;
pub use crate::table::{ENTRIES_PER_TABLE, LEVELS, LOWEST_LEVEL, PageTable, level_span, table_index};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Source of **physical** 4 KiB frames for page tables.
///
/// Returned frames must be page-aligned. The walker zeroes them itself.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame, or `None` when out of memory.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;
}

/// Makes physical memory reachable from the current address space.
///
/// During early boot this is the direct map set up by the boot stub; in
/// tests it is a host allocation standing in for RAM.
pub trait PhysMapper {
    /// Virtual address at which `pa` is currently accessible.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Borrow the bytes at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable for the whole of `T`.
    /// - `T` must match the bytes at `pa` and no other reference may alias it
    ///   for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_virt(pa).as_mut_ptr::<T>() }
    }

    /// Fill `len` bytes at `pa` with zero.
    ///
    /// # Safety
    /// The range must be mapped writable and not referenced elsewhere.
    #[inline]
    unsafe fn zero(&self, pa: PhysicalAddress, len: usize) {
        unsafe { core::ptr::write_bytes(self.phys_to_virt(pa).as_mut_ptr::<u8>(), 0, len) }
    }
}

impl<T: PhysMapper + ?Sized> PhysMapper for &T {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        (**self).phys_to_virt(pa)
    }
}
