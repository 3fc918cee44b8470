//! Host-backed stand-in for physical memory.
//!
//! [`SimRam`] owns a page-aligned, zero-initialised host allocation covering a
//! physical range `[base, base + len)` and implements [`PhysMapper`] over it.
//! Large ranges are cheap: the host allocator hands out lazily-zeroed pages.

use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

pub struct SimRam {
    base: PhysicalAddress,
    len: u64,
    ptr: NonNull<u8>,
    layout: Layout,
}

impl SimRam {
    /// # Panics
    /// If the host cannot provide the backing memory.
    #[must_use]
    pub fn new(base: PhysicalAddress, len: u64) -> Self {
        assert!(base.is_page_aligned(), "simulated RAM must start page-aligned");
        let size = usize::try_from(len).expect("simulated RAM too large for host");
        let layout = Layout::from_size_align(size, 4096).expect("invalid simulated RAM layout");
        // SAFETY: layout has a non-zero size whenever len > 0.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host out of memory");
        Self { base, len, ptr, layout }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.len)
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress, len: u64) -> bool {
        pa >= self.base && pa.as_u64() + len <= self.end().as_u64()
    }

    /// Borrow simulated memory as bytes.
    ///
    /// # Panics
    /// If the range is not backed.
    #[must_use]
    pub fn bytes(&self, pa: PhysicalAddress, len: usize) -> &[u8] {
        assert!(self.contains(pa, len as u64), "{pa} + {len:#x} outside simulated RAM");
        // SAFETY: range checked above; memory lives as long as self.
        unsafe { std::slice::from_raw_parts(self.phys_to_virt(pa).as_ptr::<u8>(), len) }
    }

    /// Fill a range with `byte`, e.g. to observe that an allocator zeroes it.
    pub fn fill(&self, pa: PhysicalAddress, len: usize, byte: u8) {
        assert!(self.contains(pa, len as u64), "{pa} + {len:#x} outside simulated RAM");
        // SAFETY: range checked above.
        unsafe { std::ptr::write_bytes(self.phys_to_virt(pa).as_mut_ptr::<u8>(), byte, len) }
    }

    pub fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        assert!(self.contains(pa, data.len() as u64), "{pa} outside simulated RAM");
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.phys_to_virt(pa).as_mut_ptr::<u8>(),
                data.len(),
            );
        }
    }
}

impl PhysMapper for SimRam {
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        assert!(self.contains(pa, 0), "{pa} outside simulated RAM");
        let offset = (pa - self.base) as usize;
        VirtualAddress::from_ptr(self.ptr.as_ptr().wrapping_add(offset))
    }
}

impl Drop for SimRam {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A trivial **bump** allocator over a physical range: hands out the next
/// 4 KiB frame and never reuses anything.
#[derive(Debug)]
pub struct BumpFrames {
    next: u64,
    end: u64,
    pub handed_out: usize,
}

impl BumpFrames {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self {
            next: start.as_u64(),
            end: end.as_u64(),
            handed_out: 0,
        }
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        if self.next + PAGE_SIZE > self.end {
            return None;
        }
        let frame = PhysicalAddress::new(self.next);
        self.next += PAGE_SIZE;
        self.handed_out += 1;
        Some(frame)
    }
}
