//! # Buddy Page Allocator
//!
//! The general-purpose physical page allocator once the region tracker has
//! been populated.
//!
//! Memory is managed in **page blocks**, one per usable available range. Each
//! block owns a metadata slice with one [`Page`] per 4 KiB frame and its own
//! set of free lists, one per order `0..=MAX_ORDER`:
//!
//! ```text
//! PageBlock { base: PFN(0x100), pages: [Page; n] }
//!   free[0]: head ─► idx 7 ─► idx 3 ─► NIL
//!   free[1]: head ─► idx 4 ─► NIL
//!   free[2]: NIL
//!   ...
//! ```
//!
//! Free lists are singly linked through the metadata by index; [`NIL`]
//! terminates them. A free run of order `k` is `2^k` pages whose first PFN is
//! a multiple of `2^k`. Only the head page of a free run is in a list; the
//! rest are marked [`PageState::Tail`].
//!
//! The buddy of PFN `p` at order `k` is `p ^ (1 << k)`. Merging never leaves
//! the page block, so runs from different blocks never combine even when
//! their PFNs are buddies.

use crate::region::RegionTracker;
use core::fmt;
use kernel_memory_addresses::{
    PAGE_SIZE, PageFrameNumber, PhysicalAddress, VirtualAddress, align_down, align_up,
};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, warn};

/// Largest order handled: runs of up to `2^MAX_ORDER` pages (4 MiB).
pub const MAX_ORDER: u8 = 10;

/// Maximum number of page blocks.
pub const MAX_PAGE_BLOCKS: usize = 32;

/// Free-list terminator.
pub const NIL: u32 = u32::MAX;

const ORDERS: usize = MAX_ORDER as usize + 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum PageState {
    /// Never released to the allocator (reserved, or above the early window).
    Reserved,
    /// Head of a free run; linked into the list of its order.
    Free,
    /// Head of an allocated run.
    Allocated,
    /// Interior page of a larger run.
    Tail,
}

/// Per-frame metadata.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct Page {
    next: u32,
    state: PageState,
    order: u8,
    block: u8,
}

impl Page {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: NIL,
            state: PageState::Reserved,
            order: 0,
            block: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> PageState {
        self.state
    }

    /// Order of the run this page heads. Only meaningful for `Free` and
    /// `Allocated` pages.
    #[inline]
    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone)]
struct FreeList {
    head: u32,
    count: usize,
}

impl FreeList {
    const EMPTY: Self = Self { head: NIL, count: 0 };
}

/// Provides storage for page metadata. The allocator initialises every
/// element itself.
pub trait PageArrayAlloc<'a> {
    /// A slice of `len` pages, or `None` if no memory is left.
    ///
    /// The tracker is passed along so that storage carved out of RAM can be
    /// recorded as reserved before the allocator releases anything.
    fn alloc_page_array(&mut self, tracker: &mut RegionTracker, len: usize) -> Option<&'a mut [Page]>;
}

struct PageBlock<'a> {
    base: PageFrameNumber,
    pages: &'a mut [Page],
    node: u8,
    free: [FreeList; ORDERS],
}

impl PageBlock<'_> {
    fn end(&self) -> u64 {
        self.base.as_u64() + self.pages.len() as u64
    }

    fn contains(&self, pfn: PageFrameNumber) -> bool {
        pfn.as_u64() >= self.base.as_u64() && pfn.as_u64() < self.end()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index_of(&self, pfn: PageFrameNumber) -> u32 {
        (pfn.as_u64() - self.base.as_u64()) as u32
    }

    fn pfn_of(&self, index: u32) -> PageFrameNumber {
        self.base.add(u64::from(index))
    }

    fn push(&mut self, order: u8, index: u32) {
        let list = &mut self.free[order as usize];
        let page = &mut self.pages[index as usize];
        page.next = list.head;
        page.state = PageState::Free;
        page.order = order;
        list.head = index;
        list.count += 1;
    }

    fn pop(&mut self, order: u8) -> Option<u32> {
        let list = &mut self.free[order as usize];
        if list.head == NIL {
            return None;
        }
        let index = list.head;
        list.head = self.pages[index as usize].next;
        list.count -= 1;
        self.pages[index as usize].next = NIL;
        Some(index)
    }

    /// Removes `index` from the list of `order`. The walk is bounded by the
    /// list's length.
    fn unlink(&mut self, order: u8, index: u32) -> bool {
        let list = &mut self.free[order as usize];
        let mut prev = NIL;
        let mut cur = list.head;
        for _ in 0..list.count {
            if cur == NIL {
                break;
            }
            if cur == index {
                let next = self.pages[cur as usize].next;
                if prev == NIL {
                    list.head = next;
                } else {
                    self.pages[prev as usize].next = next;
                }
                list.count -= 1;
                self.pages[cur as usize].next = NIL;
                return true;
            }
            prev = cur;
            cur = self.pages[cur as usize].next;
        }
        false
    }

    /// Returns a run to the free lists, merging with free buddies inside
    /// this block.
    fn release(&mut self, index: u32, order: u8) {
        let mut index = index;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy = self.pfn_of(index).buddy(order);
            if !self.contains(buddy) {
                break;
            }
            let b = self.index_of(buddy);
            let page = self.pages[b as usize];
            if page.state != PageState::Free || page.order != order {
                break;
            }
            if !self.unlink(order, b) {
                warn!("free page {buddy:?} missing from order {order} list");
                break;
            }
            self.pages[b as usize].state = PageState::Tail;
            self.pages[index as usize].state = PageState::Tail;
            index = index.min(b);
            order += 1;
        }
        self.push(order, index);
    }

    /// Takes a run of `order` if one of at least that size is free, splitting
    /// larger runs and keeping the lower half.
    fn take(&mut self, order: u8) -> Option<u32> {
        let (mut have, index) = (order..=MAX_ORDER).find_map(|k| Some((k, self.pop(k)?)))?;
        while have > order {
            have -= 1;
            self.push(have, index + (1 << have));
        }
        let page = &mut self.pages[index as usize];
        page.state = PageState::Allocated;
        page.order = order;
        Some(index)
    }

    fn free_pages(&self) -> u64 {
        self.free
            .iter()
            .enumerate()
            .map(|(k, list)| (list.count as u64) << k)
            .sum()
    }
}

/// An allocated run of `2^order` pages.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PageHandle {
    pfn: PageFrameNumber,
    block: u8,
}

impl PageHandle {
    #[inline]
    #[must_use]
    pub const fn pfn(&self) -> PageFrameNumber {
        self.pfn
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.pfn.base()
    }

    /// Where the run is visible through `mapper`.
    #[inline]
    #[must_use]
    pub fn virt(&self, mapper: &impl PhysMapper) -> VirtualAddress {
        mapper.phys_to_virt(self.phys())
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageHandle({:?}, block {})", self.pfn, self.block)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SeedError {
    #[error("system has no memory!")]
    NoUsableMemory,
    #[error("no memory for page metadata of {pages} pages")]
    MetadataExhausted { pages: u64 },
    #[error("more than 32 page blocks")]
    TooManyBlocks,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FreeError {
    #[error("{0} is not managed by the page allocator")]
    NotManaged(PhysicalAddress),
    #[error("{0} is not the head of an allocated run")]
    NotAllocated(PhysicalAddress),
    #[error("double free of {0}")]
    DoubleFree(PhysicalAddress),
    #[error("{pa} was allocated with order {allocated}, freed with order {freed}")]
    OrderMismatch {
        pa: PhysicalAddress,
        allocated: u8,
        freed: u8,
    },
}

/// Summary of one page block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    pub base: PhysicalAddress,
    pub pages: u64,
    pub free_pages: u64,
    pub node: u8,
}

pub struct BuddyAllocator<'a> {
    blocks: [Option<PageBlock<'a>>; MAX_PAGE_BLOCKS],
    len: usize,
    /// Pages at or above this address are held back until
    /// [`release_deferred`](Self::release_deferred).
    window_end: u64,
}

impl Default for BuddyAllocator<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> BuddyAllocator<'a> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocks: [const { None }; MAX_PAGE_BLOCKS],
            len: 0,
            window_end: u64::MAX,
        }
    }

    /// Builds page blocks from the tracker's available ranges and releases
    /// every page that lies below `window_end` and does not intersect a
    /// reserved range. Returns the number of pages released.
    ///
    /// Metadata for *all* blocks is obtained from `arena` before the first
    /// page is released, so storage reserved by the arena is never handed out.
    ///
    /// # Errors
    /// - [`SeedError::TooManyBlocks`] if the tracker has more usable ranges
    ///   than page blocks.
    /// - [`SeedError::MetadataExhausted`] if `arena` fails.
    /// - [`SeedError::NoUsableMemory`] if nothing could be released.
    pub fn seed<A: PageArrayAlloc<'a>>(
        &mut self,
        tracker: &mut RegionTracker,
        arena: &mut A,
        window_end: u64,
    ) -> Result<u64, SeedError> {
        self.window_end = window_end;

        let available = tracker.available().clone();
        for range in available.iter() {
            let base = align_up(range.base.as_u64(), PAGE_SIZE);
            let end = align_down(range.end(), PAGE_SIZE);
            if end <= base {
                continue;
            }
            if self.len == MAX_PAGE_BLOCKS {
                return Err(SeedError::TooManyBlocks);
            }
            let pages = ((end - base) / PAGE_SIZE).min(u64::from(NIL));
            let Ok(count) = usize::try_from(pages) else {
                return Err(SeedError::MetadataExhausted { pages });
            };
            let meta = arena
                .alloc_page_array(tracker, count)
                .ok_or(SeedError::MetadataExhausted { pages })?;

            #[allow(clippy::cast_possible_truncation)]
            let block_id = self.len as u8;
            for page in meta.iter_mut() {
                *page = Page::new();
                page.block = block_id;
            }
            debug!("page block {block_id}: [{base:#x}, {end:#x}) {pages} pages");
            self.blocks[self.len] = Some(PageBlock {
                base: PageFrameNumber::containing(PhysicalAddress::new(base)),
                pages: meta,
                node: 0,
                free: [FreeList::EMPTY; ORDERS],
            });
            self.len += 1;
        }

        let released = self.release_range(tracker, 0, window_end);
        info!("buddy: {released} pages free in {} blocks", self.len);
        if released == 0 {
            return Err(SeedError::NoUsableMemory);
        }
        Ok(released)
    }

    /// Releases the pages held back by [`seed`](Self::seed) because they lay
    /// beyond the early mapping window. Returns the number of pages released.
    pub fn release_deferred(&mut self, tracker: &RegionTracker) -> u64 {
        let released = self.release_range(tracker, self.window_end, u64::MAX);
        self.window_end = u64::MAX;
        info!("buddy: released {released} deferred pages");
        released
    }

    /// Releases every still-`Reserved` page in `[lo, hi)` that fits entirely
    /// below `hi` and is clear of reserved ranges.
    fn release_range(&mut self, tracker: &RegionTracker, lo: u64, hi: u64) -> u64 {
        let mut released = 0;
        for block in self.blocks.iter_mut().flatten() {
            for index in 0..block.pages.len() {
                #[allow(clippy::cast_possible_truncation)]
                let index = index as u32;
                let pa = block.pfn_of(index).base();
                let end = pa.as_u64() + PAGE_SIZE;
                if pa.as_u64() < lo || end > hi {
                    continue;
                }
                if block.pages[index as usize].state != PageState::Reserved
                    || tracker.intersects_reserved(pa, PAGE_SIZE)
                {
                    continue;
                }
                block.release(index, 0);
                released += 1;
            }
        }
        released
    }

    /// Allocates `2^order` physically contiguous pages.
    ///
    /// Smaller orders are tried first across all blocks before any larger
    /// run is split.
    pub fn allocate_pages(&mut self, order: u8) -> Option<PageHandle> {
        if order > MAX_ORDER {
            return None;
        }
        for k in order..=MAX_ORDER {
            for (id, block) in self.blocks.iter_mut().enumerate() {
                let Some(block) = block else { continue };
                if block.free[k as usize].head == NIL {
                    continue;
                }
                let index = block.take(order)?;
                #[allow(clippy::cast_possible_truncation)]
                let id = id as u8;
                return Some(PageHandle {
                    pfn: block.pfn_of(index),
                    block: id,
                });
            }
        }
        None
    }

    #[inline]
    pub fn allocate_page(&mut self) -> Option<PageHandle> {
        self.allocate_pages(0)
    }

    /// # Errors
    /// As for [`free_pages`](Self::free_pages) with order 0.
    #[inline]
    pub fn free_page(&mut self, handle: PageHandle) -> Result<(), FreeError> {
        self.free_pages(handle, 0)
    }

    /// Returns a run obtained from [`allocate_pages`](Self::allocate_pages).
    ///
    /// # Errors
    /// See [`FreeError`]; the allocator is left unchanged on error.
    pub fn free_pages(&mut self, handle: PageHandle, order: u8) -> Result<(), FreeError> {
        let pa = handle.phys();
        let block = self
            .blocks
            .get_mut(handle.block as usize)
            .and_then(Option::as_mut)
            .filter(|b| b.contains(handle.pfn))
            .ok_or(FreeError::NotManaged(pa))?;
        let index = block.index_of(handle.pfn);
        let page = block.pages[index as usize];
        match page.state {
            PageState::Free => return Err(FreeError::DoubleFree(pa)),
            PageState::Reserved | PageState::Tail => return Err(FreeError::NotAllocated(pa)),
            PageState::Allocated => {}
        }
        if page.order != order {
            return Err(FreeError::OrderMismatch {
                pa,
                allocated: page.order,
                freed: order,
            });
        }
        block.release(index, order);
        Ok(())
    }

    /// Handle for the page block frame containing `pa`, if managed.
    #[must_use]
    pub fn handle_for(&self, pa: PhysicalAddress) -> Option<PageHandle> {
        let pfn = PageFrameNumber::containing(pa);
        self.blocks
            .iter()
            .enumerate()
            .find_map(|(id, b)| b.as_ref().filter(|b| b.contains(pfn)).map(|_| id))
            .and_then(|id| u8::try_from(id).ok())
            .map(|block| PageHandle { pfn, block })
    }

    /// Metadata of the frame containing `pa`.
    #[must_use]
    pub fn page(&self, pa: PhysicalAddress) -> Option<&Page> {
        let handle = self.handle_for(pa)?;
        let block = self.blocks[handle.block as usize].as_ref()?;
        block.pages.get(block.index_of(handle.pfn) as usize)
    }

    /// Total number of free pages.
    #[must_use]
    pub fn free_page_count(&self) -> u64 {
        self.blocks.iter().flatten().map(PageBlock::free_pages).sum()
    }

    /// Number of free runs of exactly `order`, across all blocks.
    #[must_use]
    pub fn free_runs(&self, order: u8) -> usize {
        self.blocks
            .iter()
            .flatten()
            .filter_map(|b| b.free.get(order as usize))
            .map(|l| l.count)
            .sum()
    }

    /// Head PFNs of the free list of `order` in page block `block`, in list
    /// order.
    pub fn free_list(&self, block: usize, order: u8) -> impl Iterator<Item = PageFrameNumber> + '_ {
        let block = self.blocks.get(block).and_then(Option::as_ref);
        let (mut cur, count) = block
            .and_then(|b| b.free.get(order as usize))
            .map_or((NIL, 0), |l| (l.head, l.count));
        (0..count).map_while(move |_| {
            let b = block?;
            if cur == NIL {
                return None;
            }
            let pfn = b.pfn_of(cur);
            cur = b.pages[cur as usize].next;
            Some(pfn)
        })
    }

    /// Page blocks in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks.iter().flatten().map(|b| BlockInfo {
            base: b.base.base(),
            pages: b.pages.len() as u64,
            free_pages: b.free_pages(),
            node: b.node,
        })
    }

    /// Logs per-order free run counts.
    pub fn dump(&self) {
        for (id, info) in self.blocks().enumerate() {
            debug!(
                "block {id}: {} + {} pages, {} free",
                info.base, info.pages, info.free_pages
            );
        }
        for order in 0..=MAX_ORDER {
            debug!("order {order:2}: {} runs", self.free_runs(order));
        }
    }
}

impl FrameAlloc for BuddyAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.allocate_pages(0).map(|h| h.phys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootmem::BootstrapAllocator;
    use kernel_vmem::sim::SimRam;

    /// Metadata from the host heap; leaks on purpose so `'static` works.
    struct HeapArena;

    impl PageArrayAlloc<'static> for HeapArena {
        fn alloc_page_array(&mut self, _: &mut RegionTracker, len: usize) -> Option<&'static mut [Page]> {
            Some(Vec::leak(vec![Page::new(); len]))
        }
    }

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn tracker(available: &[(u64, u64)], reserved: &[(u64, u64)]) -> RegionTracker {
        let mut t = RegionTracker::new();
        for &(s, e) in available {
            t.add_available(pa(s), e - s);
        }
        for &(s, e) in reserved {
            t.add_reserved(pa(s), e - s);
        }
        t
    }

    fn seeded(available: &[(u64, u64)], reserved: &[(u64, u64)]) -> BuddyAllocator<'static> {
        let mut t = tracker(available, reserved);
        let mut buddy = BuddyAllocator::new();
        buddy.seed(&mut t, &mut HeapArena, u64::MAX).unwrap();
        buddy
    }

    fn snapshot(buddy: &BuddyAllocator<'_>) -> Vec<Vec<u64>> {
        let mut lists = Vec::new();
        for block in 0..MAX_PAGE_BLOCKS {
            for order in 0..=MAX_ORDER {
                let mut l: Vec<u64> = buddy.free_list(block, order).map(PageFrameNumber::as_u64).collect();
                l.sort_unstable();
                lists.push(l);
            }
        }
        lists
    }

    /// Every listed run starts on a `2^k` page boundary, is `Free` with
    /// order `k` at its head and `Tail` inside, and the lists add up to
    /// the free page count.
    fn check_free_lists(buddy: &BuddyAllocator<'_>) {
        let mut total = 0;
        for block in 0..MAX_PAGE_BLOCKS {
            for order in 0..=MAX_ORDER {
                for pfn in buddy.free_list(block, order) {
                    let n = pfn.as_u64();
                    assert_eq!(n % (1 << order), 0, "pfn {n:#x} at order {order}");
                    let head = buddy.page(pfn.base()).unwrap();
                    assert_eq!((head.state(), head.order()), (PageState::Free, order), "pfn {n:#x}");
                    for tail in n + 1..n + (1 << order) {
                        let page = buddy.page(PageFrameNumber::new(tail).base()).unwrap();
                        assert_eq!(page.state(), PageState::Tail, "pfn {tail:#x} inside {n:#x}");
                    }
                    total += 1 << order;
                }
            }
        }
        assert_eq!(total, buddy.free_page_count());
    }

    #[test]
    fn seeding_releases_everything_but_reservations() {
        let mut t = tracker(&[(0x10_0000, 0x1000_0000)], &[(0x10_0000, 0x20_0000)]);
        let mut buddy = BuddyAllocator::new();
        let released = buddy.seed(&mut t, &mut HeapArena, u64::MAX).unwrap();
        assert_eq!(released, (0x1000_0000 - 0x20_0000) / 4096);
        assert_eq!(buddy.free_page_count(), released);
        assert!(buddy.handle_for(pa(0x10_0000)).is_some());
        assert_eq!(buddy.page(pa(0x10_0000)).unwrap().state(), PageState::Reserved);
    }

    #[test]
    fn seeding_coalesces_into_max_order_runs() {
        let buddy = seeded(&[(0x40_0000, 0x80_0000)], &[]);
        assert_eq!(buddy.free_runs(MAX_ORDER), 1);
        assert_eq!(buddy.free_list(0, MAX_ORDER).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x400)]);
        for order in 0..MAX_ORDER {
            assert_eq!(buddy.free_runs(order), 0, "order {order}");
        }
    }

    #[test]
    fn seeding_with_bootstrap_metadata_excludes_metadata_pages() {
        let ram = SimRam::new(pa(0x10_0000), 0x1000_0000 - 0x10_0000);
        let mut t = tracker(&[(0x10_0000, 0x1000_0000)], &[(0x10_0000, 0x20_0000)]);
        let mut bootmem = BootstrapAllocator::new(&ram);
        let mut buddy = BuddyAllocator::new();
        let released = buddy.seed(&mut t, &mut bootmem, u64::MAX).unwrap();

        // 65280 pages * 8 bytes of metadata = 127.5 pages at 0x200000
        let meta_pages = 128;
        assert_eq!(released, (0x1000_0000 - 0x20_0000) / 4096 - meta_pages);
        assert!(t.intersects_reserved(pa(0x20_0000), 1));
        assert_eq!(buddy.page(pa(0x20_0000)).unwrap().state(), PageState::Reserved);
        assert_eq!(buddy.page(pa(0x28_0000)).unwrap().state(), PageState::Free);
    }

    #[test]
    fn no_usable_memory_is_reported() {
        let mut t = tracker(&[(0x10_0000, 0x20_0000)], &[(0x10_0000, 0x20_0000)]);
        let mut buddy = BuddyAllocator::new();
        assert_eq!(buddy.seed(&mut t, &mut HeapArena, u64::MAX), Err(SeedError::NoUsableMemory));
    }

    #[test]
    fn failing_arena_is_reported() {
        struct Empty;
        impl PageArrayAlloc<'static> for Empty {
            fn alloc_page_array(&mut self, _: &mut RegionTracker, _: usize) -> Option<&'static mut [Page]> {
                None
            }
        }
        let mut t = tracker(&[(0x10_0000, 0x20_0000)], &[]);
        let mut buddy = BuddyAllocator::new();
        assert_eq!(
            buddy.seed(&mut t, &mut Empty, u64::MAX),
            Err(SeedError::MetadataExhausted { pages: 256 })
        );
    }

    #[test]
    fn deferred_pages_are_released_later() {
        let mut t = tracker(&[(0x10_0000, 0x20_0000)], &[]);
        let mut buddy = BuddyAllocator::new();
        let early = buddy.seed(&mut t, &mut HeapArena, 0x18_0000).unwrap();
        assert_eq!(early, 128);
        assert_eq!(buddy.page(pa(0x18_0000)).unwrap().state(), PageState::Reserved);
        assert_eq!(buddy.release_deferred(&t), 128);
        assert_eq!(buddy.free_page_count(), 256);
        assert_eq!(buddy.release_deferred(&t), 0);
    }

    #[test]
    fn split_then_free_restores_the_run() {
        let mut buddy = seeded(&[(0x10_0000, 0x10_8000)], &[]);
        assert_eq!(buddy.free_list(0, 3).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x100)]);

        let h = buddy.allocate_pages(2).unwrap();
        assert_eq!(h.phys(), pa(0x10_0000));
        assert_eq!(buddy.free_list(0, 2).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x104)]);
        assert_eq!(buddy.free_runs(3), 0);

        buddy.free_pages(h, 2).unwrap();
        assert_eq!(buddy.free_list(0, 3).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x100)]);
        assert_eq!(buddy.free_runs(2), 0);
    }

    #[test]
    fn alloc_free_round_trip_restores_free_lists() {
        let mut buddy = seeded(&[(0x10_0000, 0x40_0000)], &[(0x12_3000, 0x12_5000)]);
        check_free_lists(&buddy);
        let before = snapshot(&buddy);
        let count = buddy.free_page_count();

        let mut handles = Vec::new();
        for order in [0u8, 3, 1, 0, 5, 2, 0, 4] {
            handles.push((buddy.allocate_pages(order).unwrap(), order));
            check_free_lists(&buddy);
        }
        assert!(buddy.free_page_count() < count);
        for (h, order) in handles.into_iter().rev() {
            buddy.free_pages(h, order).unwrap();
            check_free_lists(&buddy);
        }
        assert_eq!(buddy.free_page_count(), count);
        assert_eq!(snapshot(&buddy), before);
    }

    #[test]
    fn scattered_reservations_keep_runs_aligned() {
        let mut buddy = seeded(
            &[(0x10_0000, 0x80_0000), (0x90_3000, 0xa0_0000)],
            &[
                (0x10_1000, 0x10_2000),
                (0x13_7000, 0x14_9000),
                (0x20_0000, 0x20_3000),
                (0x4f_f000, 0x50_1000),
            ],
        );
        check_free_lists(&buddy);

        // free in an order unrelated to allocation so merges happen late
        let mut handles: Vec<(PageHandle, u8)> = Vec::new();
        for order in [4u8, 0, 7, 1, 10, 2, 0, 3, 9, 5] {
            if let Some(h) = buddy.allocate_pages(order) {
                handles.push((h, order));
            }
            check_free_lists(&buddy);
        }
        let mut i = 0;
        while !handles.is_empty() {
            i = (i + 3) % handles.len();
            let (h, order) = handles.swap_remove(i);
            buddy.free_pages(h, order).unwrap();
            check_free_lists(&buddy);
        }
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut buddy = seeded(&[(0x10_0000, 0x20_0000)], &[]);
        let mut taken: Vec<(u64, u64)> = Vec::new();
        for order in [0u8, 2, 1, 3, 0, 2] {
            let h = buddy.allocate_pages(order).unwrap();
            let pfn = h.pfn().as_u64();
            assert_eq!(pfn % (1 << order), 0);
            let range = (pfn, pfn + (1 << order));
            assert!(taken.iter().all(|&(s, e)| range.1 <= s || range.0 >= e));
            taken.push(range);
        }
    }

    #[test]
    fn lower_orders_are_preferred_over_splitting() {
        let mut buddy = seeded(&[(0x10_0000, 0x10_8000)], &[]);
        let a = buddy.allocate_pages(0).unwrap();
        let b = buddy.allocate_pages(0).unwrap();
        assert_eq!(a.phys(), pa(0x10_0000));
        assert_eq!(b.phys(), pa(0x10_1000));
        assert_eq!(buddy.free_runs(1), 1);
        assert_eq!(buddy.free_runs(2), 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut buddy = seeded(&[(0x10_0000, 0x10_8000)], &[]);
        assert!(buddy.allocate_pages(4).is_none());
        assert!(buddy.allocate_pages(MAX_ORDER + 1).is_none());
        for _ in 0..8 {
            assert!(buddy.alloc_4k().is_some());
        }
        assert!(buddy.alloc_4k().is_none());
        assert_eq!(buddy.free_page_count(), 0);
    }

    #[test]
    fn runs_never_merge_across_blocks() {
        // PFN 0x100 and 0x108 are order-3 buddies but live in different blocks.
        let mut buddy = seeded(&[(0x10_0000, 0x10_4000), (0x10_8000, 0x10_c000)], &[]);
        assert_eq!(buddy.blocks().count(), 2);
        assert_eq!(buddy.free_list(0, 2).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x100)]);
        assert_eq!(buddy.free_list(1, 2).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x108)]);
        assert_eq!(buddy.free_runs(3), 0);

        let a = buddy.allocate_pages(2).unwrap();
        let b = buddy.allocate_pages(2).unwrap();
        buddy.free_pages(a, 2).unwrap();
        buddy.free_pages(b, 2).unwrap();
        assert_eq!(buddy.free_runs(3), 0);
        assert_eq!(buddy.free_runs(2), 2);
    }

    #[test]
    fn reserved_page_splits_runs() {
        let buddy = seeded(&[(0x10_0000, 0x10_8000)], &[(0x10_2000, 0x10_3000)]);
        // 0x100-0x101 | 0x103 | 0x104-0x107
        assert_eq!(buddy.free_page_count(), 7);
        assert_eq!(buddy.free_list(0, 1).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x100)]);
        assert_eq!(buddy.free_list(0, 0).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x103)]);
        assert_eq!(buddy.free_list(0, 2).collect::<Vec<_>>(), vec![PageFrameNumber::new(0x104)]);
    }

    #[test]
    fn free_errors_leave_state_untouched() {
        let mut buddy = seeded(&[(0x10_0000, 0x10_8000)], &[(0x10_7000, 0x10_8000)]);
        let h = buddy.allocate_pages(1).unwrap();
        let before = snapshot(&buddy);

        assert_eq!(
            buddy.free_pages(h, 0),
            Err(FreeError::OrderMismatch { pa: h.phys(), allocated: 1, freed: 0 })
        );
        let reserved = buddy.handle_for(pa(0x10_7000)).unwrap();
        assert_eq!(buddy.free_pages(reserved, 0), Err(FreeError::NotAllocated(pa(0x10_7000))));
        assert_eq!(snapshot(&buddy), before);

        buddy.free_pages(h, 1).unwrap();
        assert_eq!(buddy.free_pages(h, 1), Err(FreeError::DoubleFree(h.phys())));
        assert!(buddy.handle_for(pa(0x20_0000)).is_none());
    }

    #[test]
    fn too_many_blocks_is_reported() {
        let mut t = RegionTracker::new();
        for i in 0..32 {
            t.add_available(pa(0x100_0000 + i * 0x2000), 0x1000);
        }
        let mut buddy = BuddyAllocator::new();
        assert_eq!(buddy.seed(&mut t, &mut HeapArena, u64::MAX).unwrap(), 32);

        let mut buddy = BuddyAllocator::new();
        buddy.len = MAX_PAGE_BLOCKS;
        assert_eq!(buddy.seed(&mut t, &mut HeapArena, u64::MAX), Err(SeedError::TooManyBlocks));
    }

    #[test]
    fn backs_page_table_construction() {
        use kernel_vmem::{AddressSpace, MapFlags, PagingFeatures};

        let ram = SimRam::new(pa(0x10_0000), 0x10_0000);
        let mut buddy = seeded(&[(0x10_1000, 0x20_0000)], &[]);
        let vas = AddressSpace::new_kernel(&ram, pa(0x10_0000), PagingFeatures::default());
        let va = VirtualAddress::new(0xffff_8000_0010_0000);
        vas.try_map_range(va, pa(0x10_0000), 0x2000, MapFlags::KERNEL_RW, &mut buddy)
            .unwrap();
        assert_eq!(vas.translate(va + 0x1234), Some(pa(0x10_1234)));
        assert_eq!(buddy.free_page_count(), 0xff - 3);
    }

    #[test]
    fn single_pages_and_their_mapping() {
        let ram = SimRam::new(pa(0x40_0000), 0x4000);
        let mut buddy = seeded(&[(0x40_0000, 0x40_4000)], &[]);
        let page = buddy.allocate_page().unwrap();
        assert_eq!(page.phys(), pa(0x40_0000));
        assert_eq!(buddy.page(page.phys()).unwrap().order(), 0);

        let va = page.virt(&ram);
        assert_eq!(va, ram.phys_to_virt(pa(0x40_0000)));
        unsafe { va.as_mut_ptr::<u64>().write(0xfeed) };
        assert_eq!(ram.bytes(pa(0x40_0000), 2), [0xed, 0xfe]);

        buddy.free_page(page).unwrap();
        assert_eq!(buddy.free_page(page), Err(FreeError::DoubleFree(pa(0x40_0000))));
        assert_eq!(buddy.free_page_count(), 4);
    }
}
