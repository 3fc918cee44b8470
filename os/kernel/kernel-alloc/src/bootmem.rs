//! # Bootstrap Allocator
//!
//! Hands out zeroed, never-freed physical memory straight from the
//! [`RegionTracker`]: find a free window, reserve it, zero it. Used for the
//! buddy allocator's page metadata and anything else needed before the buddy
//! allocator exists.

use crate::buddy::{Page, PageArrayAlloc};
use crate::region::RegionTracker;
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_vmem::PhysMapper;
use log::debug;

pub struct BootstrapAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    /// Allocations must end at or below this address; memory beyond it is
    /// not reachable through `mapper` yet.
    ceiling: u64,
}

impl<'m, M: PhysMapper> BootstrapAllocator<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            ceiling: u64::MAX,
        }
    }

    #[must_use]
    pub const fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Reserves and zeroes `nbytes` at an `align`-aligned physical address.
    ///
    /// Returns `None` for `nbytes == 0` or when no window fits.
    pub fn alloc_phys(&self, tracker: &mut RegionTracker, nbytes: u64, align: u64) -> Option<PhysicalAddress> {
        let pa = tracker.find_free_below(nbytes, align, self.ceiling)?;
        let len = usize::try_from(nbytes).ok()?;
        tracker.add_reserved(pa, nbytes);
        // SAFETY: the window lies in available RAM below the ceiling and was
        // just reserved, so nothing else references it.
        unsafe { self.mapper.zero(pa, len) };
        debug!("bootmem: {pa} + {nbytes:#x}");
        Some(pa)
    }

    /// Like [`alloc_phys`](Self::alloc_phys), returning the mapped address.
    pub fn alloc(&self, tracker: &mut RegionTracker, nbytes: u64, align: u64) -> Option<NonNull<u8>> {
        let pa = self.alloc_phys(tracker, nbytes, align)?;
        NonNull::new(self.mapper.phys_to_virt(pa).as_mut_ptr::<u8>())
    }
}

impl<'a, 'm: 'a, M: PhysMapper> PageArrayAlloc<'a> for BootstrapAllocator<'m, M> {
    fn alloc_page_array(&mut self, tracker: &mut RegionTracker, len: usize) -> Option<&'a mut [Page]> {
        let bytes = u64::try_from(len.checked_mul(size_of::<Page>())?).ok()?;
        let pa = self.alloc_phys(tracker, bytes, PAGE_SIZE)?;
        let ptr = self.mapper.phys_to_virt(pa).as_mut_ptr::<Page>();
        // SAFETY: `bytes` fresh, reserved, page-aligned bytes back `len` pages
        // and stay reserved for good.
        unsafe {
            for i in 0..len {
                ptr.add(i).write(Page::new());
            }
            Some(core::slice::from_raw_parts_mut(ptr, len))
        }
    }
}
