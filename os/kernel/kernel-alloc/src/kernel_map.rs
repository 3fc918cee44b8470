//! # Kernel Address Space
//!
//! Builds the kernel's own page tables, replacing the boot stub's:
//!
//! ```text
//! DMAP_BASE + pa        every available block, holes left unmapped
//! KLINK_OFFSET + image  the kernel image at its link address
//! ```
//!
//! Both views of the image get per-section permissions: `.text` is read-only
//! and executable, `.rodata` read-only, everything else read/write and
//! non-executable.
//!
//! Holes between available blocks stay unmapped so that
//! [`KernelMap::ioremap`] can later map device windows there uncached.
//!
//! The transition is staged and strictly forward:
//! [`BootStage::EarlyIdentityMap`] → [`BootStage::KernelVirtualMapBuilt`] →
//! [`BootStage::SwitchedToKernelVas`]. Only after the switch may the boot
//! tables lose their identity window.

use crate::region::{MemBlock, RegionTracker};
use kernel_info::memory::{KERNLINK_PA, kernel_link, p2v};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
use kernel_vmem::{AddressSpace, FrameAlloc, LEVELS, MapError, MapFlags, PageTableEntry, PhysMapper, table_index};
use log::{debug, info};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum BootStage {
    /// Running on the boot stub's tables: identity plus direct map of the
    /// first gigabyte.
    EarlyIdentityMap,
    /// Kernel tables are complete but not loaded.
    KernelVirtualMapBuilt,
    /// CR3 points at the kernel tables.
    SwitchedToKernelVas,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelMapError {
    #[error("expected boot stage {expected:?}, currently {actual:?}")]
    Stage { expected: BootStage, actual: BootStage },
    #[error("no physical memory to map")]
    NoMemory,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Physical extent of the loaded kernel image and its sections.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub image: MemBlock,
    pub text: MemBlock,
    pub rodata: MemBlock,
}

impl KernelImage {
    /// Permissions for the page at `pa`.
    #[must_use]
    pub const fn classify(&self, pa: PhysicalAddress) -> MapFlags {
        if self.text.contains(pa) {
            MapFlags::KERNEL_RX
        } else if self.rodata.contains(pa) {
            MapFlags::KERNEL_RO
        } else {
            MapFlags::KERNEL_RW
        }
    }

    /// The next section edge strictly above `pa`.
    fn next_edge(&self, pa: u64) -> Option<u64> {
        [
            self.text.base.as_u64(),
            self.text.end(),
            self.rodata.base.as_u64(),
            self.rodata.end(),
        ]
        .into_iter()
        .filter(|&edge| edge > pa)
        .min()
    }
}

/// Pages mapped by [`KernelMap::build`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MapStats {
    pub direct_pages: u64,
    pub image_pages: u64,
}

pub struct KernelMap<'m, M: PhysMapper> {
    vas: AddressSpace<'m, M>,
    stage: BootStage,
}

impl<'m, M: PhysMapper> KernelMap<'m, M> {
    /// Wraps a fresh, empty kernel address space.
    #[must_use]
    pub const fn new(vas: AddressSpace<'m, M>) -> Self {
        Self {
            vas,
            stage: BootStage::EarlyIdentityMap,
        }
    }

    #[inline]
    #[must_use]
    pub const fn stage(&self) -> BootStage {
        self.stage
    }

    #[inline]
    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<'m, M> {
        &self.vas
    }

    fn expect(&self, expected: BootStage) -> Result<(), KernelMapError> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(KernelMapError::Stage {
                expected,
                actual: self.stage,
            })
        }
    }

    fn advance(&mut self, from: BootStage, to: BootStage) -> Result<(), KernelMapError> {
        self.expect(from)?;
        debug!("boot stage {from:?} -> {to:?}");
        self.stage = to;
        Ok(())
    }

    /// Maps every available block into the direct map and the kernel image
    /// at its link address.
    ///
    /// Blocks are widened to page boundaries; a page shared by two blocks is
    /// mapped once.
    ///
    /// # Errors
    /// - [`KernelMapError::Stage`] unless called exactly once, first.
    /// - [`KernelMapError::NoMemory`] if the tracker is empty.
    /// - [`KernelMapError::Map`] if page tables run out or ranges collide.
    pub fn build<A: FrameAlloc>(
        &mut self,
        tracker: &RegionTracker,
        image: &KernelImage,
        alloc: &mut A,
    ) -> Result<MapStats, KernelMapError> {
        self.expect(BootStage::EarlyIdentityMap)?;
        if tracker.available().is_empty() {
            return Err(KernelMapError::NoMemory);
        }

        let mut direct_pages = 0;
        let mut mapped_to = 0;
        for block in tracker.available().iter() {
            let lo = align_down(block.base.as_u64(), PAGE_SIZE).max(mapped_to);
            let hi = align_up(block.end(), PAGE_SIZE);
            if lo >= hi {
                continue;
            }
            direct_pages += self.map_sections(p2v, lo, hi, image, alloc)?;
            mapped_to = hi;
            info!("kernel map: direct map [{lo:#x}, {hi:#x})");
        }

        let lo = align_down(image.image.base.as_u64(), PAGE_SIZE);
        let hi = align_up(image.image.end(), PAGE_SIZE);
        let image_pages = self.map_sections(kernel_link, lo, hi, image, alloc)?;
        info!("kernel map: image [{lo:#x}, {hi:#x}) at {}", kernel_link(PhysicalAddress::new(lo)));

        self.advance(BootStage::EarlyIdentityMap, BootStage::KernelVirtualMapBuilt)?;
        Ok(MapStats {
            direct_pages,
            image_pages,
        })
    }

    /// Maps `[lo, hi)` at `va_of(pa)`, one range per run of equal permissions.
    fn map_sections<A: FrameAlloc>(
        &self,
        va_of: impl Fn(PhysicalAddress) -> VirtualAddress,
        lo: u64,
        hi: u64,
        image: &KernelImage,
        alloc: &mut A,
    ) -> Result<u64, MapError> {
        let mut start = lo;
        while start < hi {
            let end = image.next_edge(start).map_or(hi, |edge| align_up(edge, PAGE_SIZE).min(hi));
            let end = end.max(start + PAGE_SIZE);
            let pa = PhysicalAddress::new(start);
            let flags = image.classify(pa);
            debug!("map {pa} + {:#x} as {flags:?}", end - start);
            self.vas.try_map_range(va_of(pa), pa, end - start, flags, alloc)?;
            start = end;
        }
        Ok((hi - lo) / PAGE_SIZE)
    }

    /// Loads the kernel tables into CR3.
    ///
    /// # Errors
    /// [`KernelMapError::Stage`] unless the map has been built.
    ///
    /// # Safety
    /// The code, stack and data in use must be reachable through the kernel
    /// map, i.e. running at link addresses or through the direct map.
    pub unsafe fn activate(&mut self) -> Result<(), KernelMapError> {
        self.expect(BootStage::KernelVirtualMapBuilt)?;
        unsafe { self.vas.switch_to() };
        self.advance(BootStage::KernelVirtualMapBuilt, BootStage::SwitchedToKernelVas)
    }

    /// Removes the boot tables' identity window once they are no longer
    /// loaded. Returns the cleared top-level entry.
    ///
    /// # Errors
    /// [`KernelMapError::Stage`] before [`activate`](Self::activate).
    pub fn kill_identity_map<B: PhysMapper>(
        &self,
        boot: &AddressSpace<'_, B>,
    ) -> Result<PageTableEntry, KernelMapError> {
        self.expect(BootStage::SwitchedToKernelVas)?;
        let index = table_index(LEVELS, VirtualAddress::new(KERNLINK_PA));
        let old = boot.clear_root_entry(index);
        debug!("identity map removed (root[{index}] was {:#x})", old.into_bits());
        Ok(old)
    }

    /// Maps a device window uncached into the direct map and returns the
    /// virtual address of `pa`.
    ///
    /// Pages already mapped uncached to the same frames are left alone, so
    /// overlapping windows can be mapped repeatedly. A window over RAM that
    /// the direct map already holds write-back is refused.
    ///
    /// # Errors
    /// [`KernelMapError::Stage`] before [`build`](Self::build), or
    /// [`KernelMapError::Map`].
    pub fn ioremap<A: FrameAlloc>(
        &self,
        pa: PhysicalAddress,
        len: u64,
        alloc: &mut A,
    ) -> Result<VirtualAddress, KernelMapError> {
        if self.stage == BootStage::EarlyIdentityMap {
            return Err(KernelMapError::Stage {
                expected: BootStage::KernelVirtualMapBuilt,
                actual: self.stage,
            });
        }
        let base = pa.page_base();
        let size = align_up(pa.as_u64() + len.max(1), PAGE_SIZE) - base.as_u64();
        let created = self.vas.ensure_mapped(p2v(base), base, size, MapFlags::DEVICE, alloc)?;
        debug!("ioremap {pa} + {len:#x}: {created} new pages");
        Ok(p2v(pa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::PagingFeatures;
    use kernel_vmem::sim::{BumpFrames, SimRam};

    const ROOT: u64 = 0x5f_f000;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn image() -> KernelImage {
        KernelImage {
            image: MemBlock::new(pa(0x10_0000), 0x8000),
            text: MemBlock::new(pa(0x10_0000), 0x3000),
            rodata: MemBlock::new(pa(0x10_3000), 0x2000),
        }
    }

    fn tracker() -> RegionTracker {
        let mut t = RegionTracker::new();
        t.add_available(pa(0), 0x9_f000);
        t.add_available(pa(0x10_0000), 0x70_0000);
        t
    }

    fn setup(ram: &SimRam) -> (KernelMap<'_, SimRam>, BumpFrames) {
        let vas = AddressSpace::new_kernel(ram, pa(ROOT), PagingFeatures { nx: true });
        (KernelMap::new(vas), BumpFrames::new(pa(0x60_0000), pa(0x80_0000)))
    }

    #[test]
    fn builds_direct_map_and_image_with_section_permissions() {
        let ram = SimRam::new(pa(0), 0x80_0000);
        let (mut map, mut frames) = setup(&ram);
        let stats = map.build(&tracker(), &image(), &mut frames).unwrap();
        assert_eq!(stats.direct_pages, 0x9f + 0x700);
        assert_eq!(stats.image_pages, 8);
        assert_eq!(map.stage(), BootStage::KernelVirtualMapBuilt);

        let vas = map.address_space();
        for base in [p2v(pa(0)), kernel_link(pa(0))] {
            let text = vas.lookup(base + 0x10_1000).unwrap();
            assert!(text.present() && !text.writable() && !text.no_execute());
            let rodata = vas.lookup(base + 0x10_4000).unwrap();
            assert!(rodata.present() && !rodata.writable() && rodata.no_execute());
            let data = vas.lookup(base + 0x10_7000).unwrap();
            assert!(data.present() && data.writable() && data.no_execute());
        }
        assert_eq!(vas.translate(p2v(pa(0x7f_f123))), Some(pa(0x7f_f123)));
        assert_eq!(vas.translate(p2v(pa(0x9_e123))), Some(pa(0x9_e123)));
        assert_eq!(vas.translate(p2v(pa(0x9_f000))), None);
        assert_eq!(vas.translate(p2v(pa(0xf_f000))), None);
        assert_eq!(vas.translate(kernel_link(pa(0x10_0abc))), Some(pa(0x10_0abc)));
        assert_eq!(vas.translate(kernel_link(pa(0x10_8000))), None);
        assert_eq!(vas.translate(VirtualAddress::new(KERNLINK_PA)), None);
    }

    #[test]
    fn stages_only_move_forward() {
        let ram = SimRam::new(pa(0), 0x80_0000);
        let (mut map, mut frames) = setup(&ram);
        let boot = AddressSpace::new_kernel(&ram, pa(0x5f_e000), PagingFeatures::default());

        assert!(matches!(
            map.ioremap(pa(0xfed0_0000), 0x400, &mut frames),
            Err(KernelMapError::Stage { .. })
        ));
        assert!(matches!(map.kill_identity_map(&boot), Err(KernelMapError::Stage { .. })));

        map.build(&tracker(), &image(), &mut frames).unwrap();
        assert_eq!(
            map.build(&tracker(), &image(), &mut frames),
            Err(KernelMapError::Stage {
                expected: BootStage::EarlyIdentityMap,
                actual: BootStage::KernelVirtualMapBuilt,
            })
        );
        assert!(map.kill_identity_map(&boot).is_err());

        map.advance(BootStage::KernelVirtualMapBuilt, BootStage::SwitchedToKernelVas)
            .unwrap();
        assert!(map.advance(BootStage::KernelVirtualMapBuilt, BootStage::SwitchedToKernelVas).is_err());
    }

    #[test]
    fn identity_window_is_removed_from_boot_tables() {
        let ram = SimRam::new(pa(0), 0x80_0000);
        let (mut map, mut frames) = setup(&ram);
        let boot = AddressSpace::new_kernel(&ram, pa(0x5f_e000), PagingFeatures::default());
        boot.try_map_range(VirtualAddress::new(0), pa(0), 0x20_0000, MapFlags::KERNEL_RW, &mut frames)
            .unwrap();
        boot.try_map_range(p2v(pa(0)), pa(0), 0x1000, MapFlags::KERNEL_RW, &mut frames)
            .unwrap();

        map.build(&tracker(), &image(), &mut frames).unwrap();
        map.advance(BootStage::KernelVirtualMapBuilt, BootStage::SwitchedToKernelVas)
            .unwrap();
        let old = map.kill_identity_map(&boot).unwrap();
        assert!(old.present());
        assert_eq!(boot.translate(VirtualAddress::new(KERNLINK_PA)), None);
        assert_eq!(boot.translate(p2v(pa(0))), Some(pa(0)));
    }

    #[test]
    fn ioremap_maps_uncached_and_tolerates_overlap() {
        let ram = SimRam::new(pa(0), 0x80_0000);
        let (mut map, mut frames) = setup(&ram);
        map.build(&tracker(), &image(), &mut frames).unwrap();

        let va = map.ioremap(pa(0xfee0_0020), 0x10, &mut frames).unwrap();
        assert_eq!(va, p2v(pa(0xfee0_0020)));
        let entry = map.address_space().lookup(p2v(pa(0xfee0_0000))).unwrap();
        assert!(entry.present() && entry.cache_disabled() && entry.write_through());

        let used = frames.handed_out;
        assert_eq!(map.ioremap(pa(0xfee0_0000), PAGE_SIZE, &mut frames).unwrap(), p2v(pa(0xfee0_0000)));
        assert_eq!(frames.handed_out, used);

        // crossing a page boundary maps both pages
        map.ioremap(pa(0xfed0_0ff8), 0x10, &mut frames).unwrap();
        assert!(map.address_space().translate(p2v(pa(0xfed0_1000))).is_some());
    }

    #[test]
    fn device_window_in_a_ram_hole_is_uncached() {
        let ram = SimRam::new(pa(0), 0x80_0000);
        let (mut map, mut frames) = setup(&ram);
        let mut t = RegionTracker::new();
        t.add_available(pa(0x10_0000), 0x10_0000);
        t.add_available(pa(0x40_0000), 0x20_0000);
        let stats = map.build(&t, &image(), &mut frames).unwrap();
        assert_eq!(stats.direct_pages, 0x100 + 0x200);
        assert_eq!(map.address_space().translate(p2v(pa(0x30_0000))), None);
        assert_eq!(map.address_space().translate(p2v(pa(0x5f_f000))), Some(pa(0x5f_f000)));

        let va = map.ioremap(pa(0x30_0000), 0x400, &mut frames).unwrap();
        assert_eq!(va, p2v(pa(0x30_0000)));
        let entry = map.address_space().lookup(va).unwrap();
        assert!(entry.present() && entry.cache_disabled() && entry.write_through() && entry.no_execute());

        assert_eq!(
            map.ioremap(pa(0x40_0000), 0x400, &mut frames),
            Err(KernelMapError::Map(MapError::AttributeConflict(p2v(pa(0x40_0000)))))
        );
        let ram_page = map.address_space().lookup(p2v(pa(0x40_0000))).unwrap();
        assert!(!ram_page.cache_disabled());
    }

    #[test]
    fn unaligned_neighbouring_blocks_share_a_page() {
        let ram = SimRam::new(pa(0), 0x80_0000);
        let (mut map, mut frames) = setup(&ram);
        let mut t = RegionTracker::new();
        t.add_available(pa(0x20_0000), 0x800);
        t.add_available(pa(0x20_0c00), 0x1400);
        let stats = map.build(&t, &image(), &mut frames).unwrap();
        assert_eq!(stats.direct_pages, 2);
        assert_eq!(map.address_space().translate(p2v(pa(0x20_1fff))), Some(pa(0x20_1fff)));
    }

    #[test]
    fn empty_tracker_is_rejected() {
        let ram = SimRam::new(pa(0), 0x80_0000);
        let (mut map, mut frames) = setup(&ram);
        assert_eq!(
            map.build(&RegionTracker::new(), &image(), &mut frames),
            Err(KernelMapError::NoMemory)
        );
    }
}
