//! # Address Space (x86-64, 4-level)
//!
//! A handle to one page table tree plus everything needed to edit it: the
//! root frame, the [`PhysMapper`] used to reach table frames and the
//! [`PagingFeatures`] of the CPU.
//!
//! ## Highlights
//!
//! - [`AddressSpace::page_walk`] finds the leaf slot for a VA, creating and
//!   zeroing missing intermediate tables on the way.
//! - [`AddressSpace::map_range`] / [`try_map_range`](AddressSpace::try_map_range)
//!   install 4 KiB leaves for a whole range; a slot that is already in use is
//!   an error, never silently overwritten.
//! - [`AddressSpace::translate`] resolves a VA including the in-page offset.
//! - [`AddressSpace::switch_to`] loads CR3.
//!
//! ## Safety
//!
//! Editing the *active* tree needs TLB maintenance afterwards (CR3 reload or
//! `invlpg`); the methods here only write memory.

use crate::{
    FrameAlloc, LEVELS, LOWEST_LEVEL, MapFlags, PageTable, PageTableEntry, PhysMapper, level_span,
    table_index,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe, cr3::Cr3, efer::Efer};
use log::trace;

/// Paging capabilities discovered once at boot.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PagingFeatures {
    /// `EFER.NXE` is set; leaf entries may carry the no-execute bit.
    pub nx: bool,
}

impl PagingFeatures {
    /// Reads `EFER.NXE`.
    ///
    /// # Safety
    /// Ring 0 only (`RDMSR`).
    #[must_use]
    pub unsafe fn detect() -> Self {
        let efer = unsafe { Efer::load_unsafe() };
        Self { nx: efer.nxe() }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("mapping {va} -> {pa} is not page-aligned")]
    Unaligned {
        va: VirtualAddress,
        pa: PhysicalAddress,
    },
    #[error("this entry has been used: va {0}")]
    AlreadyMapped(VirtualAddress),
    #[error("va {0} is already mapped with other caching")]
    AttributeConflict(VirtualAddress),
    #[error("out of memory for page tables at va {0}")]
    OutOfMemory(VirtualAddress),
    #[error("va {0} lies inside a huge page")]
    HugePage(VirtualAddress),
    #[error("va {0} is not mapped")]
    NotMapped(VirtualAddress),
}

/// Handle to a single page table tree.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    user: bool,
    features: PagingFeatures,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Takes ownership of the frame at `root` as the top-level table of a new
    /// kernel address space and clears it.
    ///
    /// # Panics
    /// If `root` is null or not page-aligned.
    pub fn new_kernel(mapper: &'m M, root: PhysicalAddress, features: PagingFeatures) -> Self {
        assert!(!root.is_null(), "NULL pgdir");
        assert!(root.is_page_aligned(), "pgdir must be page-aligned");
        let vas = Self {
            root,
            user: false,
            features,
            mapper,
        };
        vas.table(root).zero();
        vas
    }

    /// Wraps an existing tree without touching it (e.g. the boot tables).
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalAddress, features: PagingFeatures) -> Self {
        Self {
            root,
            user: false,
            features,
            mapper,
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn levels(&self) -> u8 {
        LEVELS
    }

    #[inline]
    #[must_use]
    pub const fn lowest_level(&self) -> u8 {
        LOWEST_LEVEL
    }

    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.user
    }

    #[inline]
    #[must_use]
    pub const fn features(&self) -> PagingFeatures {
        self.features
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Borrow the table stored in `frame`.
    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysicalAddress) -> &mut PageTable {
        // SAFETY: every frame reached from the root is a page table that the
        // mapper exposes writable. Callers never hold two borrows of the same
        // entry at once.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame) }
    }

    /// Walks down to the leaf slot of `va`. Missing tables are allocated from
    /// `alloc` when given, otherwise the walk fails with `NotMapped`.
    #[allow(clippy::mut_from_ref)]
    fn descend(
        &self,
        va: VirtualAddress,
        mut alloc: Option<&mut dyn FrameAlloc>,
    ) -> Result<&mut PageTableEntry, MapError> {
        let mut frame = self.root;
        for level in (LOWEST_LEVEL + 1..=LEVELS).rev() {
            let entry = self.table(frame).entry_mut(table_index(level, va));
            if !entry.present() {
                let Some(alloc) = alloc.as_mut() else {
                    return Err(MapError::NotMapped(va));
                };
                let next = alloc.alloc_4k().ok_or(MapError::OutOfMemory(va))?;
                debug_assert!(next.is_page_aligned());
                self.table(next).zero();
                *entry = PageTableEntry::table(next, self.user);
                trace!("new L{} table at {next} for {va}", level - 1);
            } else if entry.huge() {
                return Err(MapError::HugePage(va));
            }
            frame = entry.frame();
        }
        Ok(self.table(frame).entry_mut(table_index(LOWEST_LEVEL, va)))
    }

    /// The leaf slot for `va`, allocating intermediate tables as needed.
    ///
    /// Returns `None` if a table could not be allocated or `va` falls inside
    /// a huge page.
    #[allow(clippy::mut_from_ref)]
    pub fn page_walk<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        alloc: &mut A,
    ) -> Option<&mut PageTableEntry> {
        self.descend(va, Some(alloc as &mut dyn FrameAlloc)).ok()
    }

    /// The leaf slot for `va` if all intermediate tables exist.
    #[allow(clippy::mut_from_ref)]
    pub fn lookup(&self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        self.descend(va, None).ok()
    }

    /// Leaf entry for `pa` with the given permissions.
    #[must_use]
    pub const fn leaf_entry(&self, pa: PhysicalAddress, flags: MapFlags) -> PageTableEntry {
        PageTableEntry::new()
            .with_present(true)
            .with_writable(flags.writable())
            .with_user(flags.user())
            .with_write_through(flags.device())
            .with_cache_disabled(flags.device())
            .with_no_execute(self.features.nx && !flags.executable())
            .with_frame(pa)
    }

    /// Maps `[va, va + size)` to `[pa, pa + size)` with 4 KiB pages.
    ///
    /// `size` is rounded up to whole pages. The range is checked for
    /// existing mappings before anything is written, so `AlreadyMapped` leaves
    /// the tree unchanged; `OutOfMemory` may leave a prefix mapped.
    ///
    /// # Errors
    /// See [`MapError`].
    pub fn try_map_range<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: MapFlags,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned { va, pa });
        }
        let pages = align_up(size, PAGE_SIZE) / PAGE_SIZE;

        for i in 0..pages {
            let page = va + i * PAGE_SIZE;
            match self.descend(page, None) {
                Ok(entry) if entry.present() => return Err(MapError::AlreadyMapped(page)),
                Err(MapError::HugePage(_)) => return Err(MapError::HugePage(page)),
                _ => {}
            }
        }

        for i in 0..pages {
            let page = va + i * PAGE_SIZE;
            let entry = self.descend(page, Some(&mut *alloc as &mut dyn FrameAlloc))?;
            *entry = self.leaf_entry(pa + i * PAGE_SIZE, flags);
        }
        Ok(())
    }

    /// Like [`try_map_range`](Self::try_map_range), but a failure is fatal.
    ///
    /// # Panics
    /// If a page in the range is already mapped ("this entry has been used")
    /// or a page table cannot be allocated ("null pte").
    pub fn map_range<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: MapFlags,
        alloc: &mut A,
    ) {
        match self.try_map_range(va, pa, size, flags, alloc) {
            Ok(()) => {}
            Err(MapError::AlreadyMapped(page)) => panic!("this entry has been used: va {page}"),
            Err(MapError::OutOfMemory(page)) => panic!("null pte {page}"),
            Err(err) => panic!("map_range: {err}"),
        }
    }

    /// Maps a device window, tolerating pages that already map the same frame
    /// with the same caching.
    ///
    /// # Errors
    /// `AlreadyMapped` if a page maps a *different* frame, `AttributeConflict`
    /// if it maps the frame with other `PCD`/`PWT` bits, otherwise as
    /// [`try_map_range`](Self::try_map_range).
    pub fn ensure_mapped<A: FrameAlloc>(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: MapFlags,
        alloc: &mut A,
    ) -> Result<usize, MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned { va, pa });
        }
        let pages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
        let mut created = 0;
        for i in 0..pages {
            let page = va + i * PAGE_SIZE;
            let frame = pa + i * PAGE_SIZE;
            let entry = self.descend(page, Some(&mut *alloc as &mut dyn FrameAlloc))?;
            let wanted = self.leaf_entry(frame, flags);
            if entry.present() {
                if entry.frame() != frame {
                    return Err(MapError::AlreadyMapped(page));
                }
                if entry.cache_disabled() != wanted.cache_disabled()
                    || entry.write_through() != wanted.write_through()
                {
                    return Err(MapError::AttributeConflict(page));
                }
                continue;
            }
            *entry = wanted;
            created += 1;
        }
        Ok(created)
    }

    /// Clears the leaves of `[va, va + size)`. Returns how many were present.
    ///
    /// Intermediate tables are kept. The caller flushes the TLB.
    pub fn unmap_range(&self, va: VirtualAddress, size: u64) -> usize {
        let pages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
        let mut cleared = 0;
        for i in 0..pages {
            if let Some(entry) = self.lookup(va.page_base() + i * PAGE_SIZE)
                && entry.present()
            {
                *entry = PageTableEntry::zero();
                cleared += 1;
            }
        }
        cleared
    }

    /// Physical address behind `va`, including the in-page offset.
    ///
    /// Huge leaves left by the boot tables are resolved too.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut frame = self.root;
        for level in (LOWEST_LEVEL..=LEVELS).rev() {
            let entry = self.table(frame).get(table_index(level, va));
            if !entry.present() {
                return None;
            }
            if level == LOWEST_LEVEL || entry.huge() {
                let mask = level_span(level) - 1;
                let base = entry.frame().as_u64() & !mask;
                return Some(PhysicalAddress::new(base | (va.as_u64() & mask)));
            }
            frame = entry.frame();
        }
        None
    }

    /// Clears top-level entry `index` and returns its old value.
    pub fn clear_root_entry(&self, index: usize) -> PageTableEntry {
        let table = self.table(self.root);
        let old = table.get(index);
        table.set(index, PageTableEntry::zero());
        old
    }

    /// Load CR3 with this tree's root.
    ///
    /// # Safety
    /// The tree must map the currently executing code, the stack and every
    /// piece of data the caller will touch afterwards.
    pub unsafe fn switch_to(&self) {
        unsafe { Cr3::from_root(self.root).store_unsafe() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BumpFrames, SimRam};

    const RAM: u64 = 256 * PAGE_SIZE;

    fn setup() -> (SimRam, BumpFrames) {
        let ram = SimRam::new(PhysicalAddress::zero(), RAM);
        let frames = BumpFrames::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(RAM));
        (ram, frames)
    }

    fn nx() -> PagingFeatures {
        PagingFeatures { nx: true }
    }

    #[test]
    fn map_one_4k_creates_tables_and_leaf() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());

        let va = VirtualAddress::new(0xffff_8000_0030_0000);
        let pa = PhysicalAddress::new(0x0030_0000);
        vas.map_range(va, pa, PAGE_SIZE, MapFlags::KERNEL_RW, &mut frames);

        // three intermediate tables
        assert_eq!(frames.handed_out, 4);

        let leaf = vas.lookup(va).copied().unwrap();
        assert!(leaf.present());
        assert!(leaf.writable());
        assert!(leaf.no_execute());
        assert!(!leaf.user());
        assert_eq!(leaf.frame(), pa);

        let l4 = unsafe { ram.phys_to_mut::<PageTable>(root) }.get(256);
        assert!(l4.present() && l4.writable() && !l4.no_execute());
    }

    #[test]
    fn translate_includes_offset() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let va = VirtualAddress::new(0xffff_ffff_8010_0000);
        vas.map_range(va, PhysicalAddress::new(0x10_0000), 3 * PAGE_SIZE, MapFlags::KERNEL_RX, &mut frames);

        assert_eq!(
            vas.translate(va + 0x2abc),
            Some(PhysicalAddress::new(0x10_2abc))
        );
        assert_eq!(vas.translate(va + 3 * PAGE_SIZE), None);
        assert!(!vas.lookup(va).unwrap().no_execute());
        assert!(!vas.lookup(va).unwrap().writable());
    }

    #[test]
    fn nx_only_when_supported() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, PagingFeatures { nx: false });
        let va = VirtualAddress::new(0x40_0000);
        vas.map_range(va, PhysicalAddress::new(0x40_0000), PAGE_SIZE, MapFlags::KERNEL_RW, &mut frames);
        assert!(!vas.lookup(va).unwrap().no_execute());
    }

    #[test]
    fn device_mappings_are_uncached() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let va = VirtualAddress::new(0xffff_8000_fed0_0000);
        vas.map_range(va, PhysicalAddress::new(0xfed0_0000), PAGE_SIZE, MapFlags::DEVICE, &mut frames);
        let leaf = vas.lookup(va).copied().unwrap();
        assert!(leaf.cache_disabled() && leaf.write_through());
    }

    #[test]
    fn double_map_is_rejected_without_changes() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let va = VirtualAddress::new(0x20_1000);
        vas.map_range(va, PhysicalAddress::new(0x20_1000), PAGE_SIZE, MapFlags::KERNEL_RW, &mut frames);

        let err = vas
            .try_map_range(
                VirtualAddress::new(0x20_0000),
                PhysicalAddress::new(0x50_0000),
                2 * PAGE_SIZE,
                MapFlags::KERNEL_RW,
                &mut frames,
            )
            .unwrap_err();
        assert_eq!(err, MapError::AlreadyMapped(va));
        assert!(!vas.lookup(VirtualAddress::new(0x20_0000)).unwrap().present());
        assert_eq!(vas.translate(va), Some(PhysicalAddress::new(0x20_1000)));
    }

    #[test]
    #[should_panic(expected = "this entry has been used")]
    fn map_range_panics_on_double_map() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let va = VirtualAddress::new(0x20_0000);
        vas.map_range(va, PhysicalAddress::new(0x20_0000), PAGE_SIZE, MapFlags::KERNEL_RW, &mut frames);
        vas.map_range(va, PhysicalAddress::new(0x30_0000), PAGE_SIZE, MapFlags::KERNEL_RW, &mut frames);
    }

    #[test]
    #[should_panic(expected = "null pte")]
    fn map_range_panics_when_tables_run_out() {
        let ram = SimRam::new(PhysicalAddress::zero(), RAM);
        let mut frames = BumpFrames::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x3000));
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        vas.map_range(
            VirtualAddress::new(0x20_0000),
            PhysicalAddress::new(0x20_0000),
            PAGE_SIZE,
            MapFlags::KERNEL_RW,
            &mut frames,
        );
    }

    #[test]
    #[should_panic(expected = "NULL pgdir")]
    fn null_root_is_fatal() {
        let ram = SimRam::new(PhysicalAddress::zero(), RAM);
        let _ = AddressSpace::new_kernel(&ram, PhysicalAddress::zero(), nx());
    }

    #[test]
    #[should_panic(expected = "pgdir must be page-aligned")]
    fn misaligned_root_is_fatal() {
        let ram = SimRam::new(PhysicalAddress::zero(), RAM);
        let _ = AddressSpace::new_kernel(&ram, PhysicalAddress::new(0x1008), nx());
    }

    #[test]
    fn new_kernel_clears_the_root() {
        let ram = SimRam::new(PhysicalAddress::zero(), RAM);
        ram.fill(PhysicalAddress::new(0x2000), 4096, 0xa5);
        let vas = AddressSpace::new_kernel(&ram, PhysicalAddress::new(0x2000), nx());
        assert!(ram.bytes(vas.root(), 4096).iter().all(|&b| b == 0));
    }

    #[test]
    fn page_walk_reuses_tables() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let a = VirtualAddress::new(0xffff_8000_0000_0000);
        assert!(vas.page_walk(a, &mut frames).is_some());
        let after_first = frames.handed_out;
        assert!(vas.page_walk(a + PAGE_SIZE, &mut frames).is_some());
        assert_eq!(frames.handed_out, after_first);
        assert!(vas.lookup(VirtualAddress::new(0x1000)).is_none());
    }

    #[test]
    fn unmap_then_translate_fails() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let va = VirtualAddress::new(0x60_0000);
        vas.map_range(va, PhysicalAddress::new(0x60_0000), 4 * PAGE_SIZE, MapFlags::KERNEL_RW, &mut frames);
        assert_eq!(vas.unmap_range(va + PAGE_SIZE, 2 * PAGE_SIZE), 2);
        assert!(vas.translate(va).is_some());
        assert!(vas.translate(va + PAGE_SIZE).is_none());
        assert!(vas.translate(va + 2 * PAGE_SIZE).is_none());
        assert!(vas.translate(va + 3 * PAGE_SIZE).is_some());
        assert_eq!(vas.unmap_range(va + PAGE_SIZE, PAGE_SIZE), 0);
    }

    #[test]
    fn ensure_mapped_tolerates_identical_mappings() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let va = VirtualAddress::new(0xffff_8000_fee0_0000);
        let pa = PhysicalAddress::new(0xfee0_0000);
        assert_eq!(vas.ensure_mapped(va, pa, PAGE_SIZE, MapFlags::DEVICE, &mut frames), Ok(1));
        assert_eq!(vas.ensure_mapped(va, pa, PAGE_SIZE, MapFlags::DEVICE, &mut frames), Ok(0));
        assert_eq!(
            vas.ensure_mapped(va, PhysicalAddress::new(0xfec0_0000), PAGE_SIZE, MapFlags::DEVICE, &mut frames),
            Err(MapError::AlreadyMapped(va))
        );
    }

    #[test]
    fn ensure_mapped_refuses_cached_pages() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        let va = VirtualAddress::new(0xffff_8000_0030_0000);
        let pa = PhysicalAddress::new(0x30_0000);
        vas.try_map_range(va + PAGE_SIZE, pa + PAGE_SIZE, PAGE_SIZE, MapFlags::KERNEL_RW, &mut frames)
            .unwrap();

        assert_eq!(
            vas.ensure_mapped(va, pa, 2 * PAGE_SIZE, MapFlags::DEVICE, &mut frames),
            Err(MapError::AttributeConflict(va + PAGE_SIZE))
        );
        let cached = vas.lookup(va + PAGE_SIZE).unwrap();
        assert!(!cached.cache_disabled() && !cached.write_through());
    }

    #[test]
    fn translate_resolves_huge_pages() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        // hand-build a 2 MiB leaf the way the boot stub does
        let l3 = frames.alloc_4k().unwrap();
        let l2 = frames.alloc_4k().unwrap();
        let table = |pa| unsafe { ram.phys_to_mut::<PageTable>(pa) };
        table(root).set(0, PageTableEntry::table(l3, false));
        table(l3).set(0, PageTableEntry::table(l2, false));
        table(l2).set(
            1,
            PageTableEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_huge(true)
                .with_frame(PhysicalAddress::new(0x20_0000)),
        );

        assert_eq!(
            vas.translate(VirtualAddress::new(0x2f_1234)),
            Some(PhysicalAddress::new(0x2f_1234))
        );
        assert_eq!(
            vas.try_map_range(
                VirtualAddress::new(0x20_0000),
                PhysicalAddress::new(0x20_0000),
                PAGE_SIZE,
                MapFlags::KERNEL_RW,
                &mut frames
            ),
            Err(MapError::HugePage(VirtualAddress::new(0x20_0000)))
        );

        let old = vas.clear_root_entry(0);
        assert!(old.present());
        assert_eq!(vas.translate(VirtualAddress::new(0x2f_1234)), None);
    }

    #[test]
    fn unaligned_requests_are_rejected() {
        let (ram, mut frames) = setup();
        let root = frames.alloc_4k().unwrap();
        let vas = AddressSpace::new_kernel(&ram, root, nx());
        assert!(matches!(
            vas.try_map_range(
                VirtualAddress::new(0x1234),
                PhysicalAddress::new(0x2000),
                PAGE_SIZE,
                MapFlags::KERNEL_RW,
                &mut frames
            ),
            Err(MapError::Unaligned { .. })
        ));
    }
}
