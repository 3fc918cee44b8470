//! # Boot Context
//!
//! Owns the physical memory picture while the kernel comes up: the firmware
//! memory map goes into a [`RegionTracker`], the boot-time reservations are
//! added on top, and [`BootContext::bring_up_memory`] turns that into a seeded
//! buddy allocator and a built kernel address space.
//!
//! Everything here is generic over the [`PhysMapper`] so the same sequence
//! runs against simulated RAM in the host tests.

use core::str::FromStr;
use kernel_alloc::bootmem::BootstrapAllocator;
use kernel_alloc::buddy::BuddyAllocator;
use kernel_alloc::kernel_map::{KernelImage, KernelMap};
use kernel_alloc::region::RegionTracker;
use kernel_info::boot::{BootInfo, MemoryKind, MemoryMapEntry};
use kernel_info::memory::LOW_MEMORY_END;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{AddressSpace, FrameAlloc, PagingFeatures, PhysMapper};
use log::{LevelFilter, debug, info, warn};

/// State carried through the boot sequence.
#[derive(Debug, Default)]
pub struct BootContext {
    pub tracker: RegionTracker,
}

/// The memory core once the kernel map is built.
pub struct MemoryCore<'m, M: PhysMapper> {
    pub buddy: BuddyAllocator<'m>,
    pub kmap: KernelMap<'m, M>,
}

impl BootContext {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tracker: RegionTracker::new(),
        }
    }

    /// Feeds the memory map into the tracker and logs what the loader passed
    /// along. Returns the log level asked for with `loglevel=`.
    pub fn load_boot_info(&mut self, info: &BootInfo<'_>) -> Option<LevelFilter> {
        if let Some(name) = info.boot_loader_name() {
            info!("boot loader: {name}");
        }
        if let Some(dev) = info.boot_device() {
            info!("boot device: {:#x} slice {} part {}", dev.biosdev, dev.slice, dev.part);
        }

        match info.memory_map() {
            Some(map) => map.entries().for_each(|entry| self.add_map_entry(entry)),
            None => warn!("boot information carries no memory map"),
        }

        let cmdline = info.command_line()?;
        info!("command line: {}", cmdline.as_str());
        let level = cmdline.get("loglevel")?;
        let parsed = LevelFilter::from_str(level).ok();
        if parsed.is_none() {
            warn!("ignoring unknown loglevel {level:?}");
        }
        parsed
    }

    fn add_map_entry(&mut self, entry: MemoryMapEntry) {
        debug!("mmap: {} + {:#x} {:?}", entry.base, entry.length, entry.kind);
        match entry.kind {
            MemoryKind::Available => self.tracker.add_available(entry.base, entry.length),
            MemoryKind::Reserved => self.tracker.add_reserved(entry.base, entry.length),
            _ => {}
        }
    }

    /// Reserves the real-mode area, the kernel image and the boot
    /// information so no allocator hands them out.
    pub fn reserve_boot_regions(&mut self, image: &KernelImage, info: (PhysicalAddress, u64)) {
        self.tracker.add_reserved(PhysicalAddress::zero(), LOW_MEMORY_END);
        self.tracker.add_reserved(image.image.base, image.image.size);
        self.tracker.add_reserved(info.0, info.1);
        self.tracker.dump();
    }

    /// Seeds the buddy allocator from the tracker and builds the kernel
    /// address space with page tables taken from it.
    ///
    /// Only pages below `window_end` are released now; the rest wait for
    /// [`BuddyAllocator::release_deferred`] once the kernel map is live.
    ///
    /// # Panics
    /// When the tracker yields no usable page, or the kernel map cannot be
    /// built. Neither is recoverable this early.
    pub fn bring_up_memory<'m, M: PhysMapper>(
        &mut self,
        mapper: &'m M,
        image: &KernelImage,
        features: PagingFeatures,
        window_end: u64,
    ) -> MemoryCore<'m, M> {
        let mut bootmem = BootstrapAllocator::new(mapper).with_ceiling(window_end);
        let mut buddy = BuddyAllocator::new();
        if let Err(e) = buddy.seed(&mut self.tracker, &mut bootmem, window_end) {
            panic!("{e}");
        }

        let Some(root) = buddy.alloc_4k() else {
            panic!("no page for the kernel root table");
        };
        let mut kmap = KernelMap::new(AddressSpace::new_kernel(mapper, root, features));
        match kmap.build(&self.tracker, image, &mut buddy) {
            Ok(stats) => info!(
                "kernel map: {} direct, {} image pages, root {root}",
                stats.direct_pages, stats.image_pages
            ),
            Err(e) => panic!("kernel map: {e}"),
        }
        MemoryCore { buddy, kmap }
    }
}
