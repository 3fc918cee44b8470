//! Memory-mapped register access.

use kernel_memory_addresses::VirtualAddress;

/// A device register window addressed by byte offset.
pub trait RegisterBlock {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, val: u32);

    /// Low half first.
    fn read64(&self, offset: usize) -> u64 {
        u64::from(self.read32(offset)) | (u64::from(self.read32(offset + 4)) << 32)
    }

    /// Low half first.
    #[allow(clippy::cast_possible_truncation)]
    fn write64(&self, offset: usize, val: u64) {
        self.write32(offset, val as u32);
        self.write32(offset + 4, (val >> 32) as u32);
    }
}

impl<T: RegisterBlock + ?Sized> RegisterBlock for &T {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, val: u32) {
        (**self).write32(offset, val);
    }

    fn read64(&self, offset: usize) -> u64 {
        (**self).read64(offset)
    }

    fn write64(&self, offset: usize, val: u64) {
        (**self).write64(offset, val);
    }
}

/// Volatile accesses to an uncached mapping.
#[derive(Debug, Copy, Clone)]
pub struct Mmio {
    base: VirtualAddress,
    len: usize,
}

impl Mmio {
    /// # Safety
    /// `[base, base + len)` must be a live device mapping (e.g. from
    /// `KernelMap::ioremap`) that stays mapped for the lifetime of this value.
    #[must_use]
    pub const unsafe fn new(base: VirtualAddress, len: usize) -> Self {
        Self { base, len }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + size_of::<T>() <= self.len, "mmio offset {offset:#x} out of range");
        debug_assert!(offset % align_of::<T>() == 0);
        (self.base + offset as u64).as_mut_ptr::<T>()
    }
}

impl RegisterBlock for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: constructor contract; offset checked in debug builds.
        unsafe { self.ptr::<u32>(offset).read_volatile() }
    }

    fn write32(&self, offset: usize, val: u32) {
        // SAFETY: as above.
        unsafe { self.ptr::<u32>(offset).write_volatile(val) }
    }

    fn read64(&self, offset: usize) -> u64 {
        // SAFETY: as above.
        unsafe { self.ptr::<u64>(offset).read_volatile() }
    }

    fn write64(&self, offset: usize, val: u64) {
        // SAFETY: as above.
        unsafe { self.ptr::<u64>(offset).write_volatile(val) }
    }
}
