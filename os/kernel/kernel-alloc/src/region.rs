//! # Physical Region Tracker
//!
//! Two fixed-capacity, sorted lists of physical ranges: what firmware reported
//! as usable RAM ("Available") and what has been carved out of it since
//! ("Reserved": the kernel image, allocator metadata, MMIO windows, bootstrap
//! allocations).
//!
//! ```text
//! Available  [0x0000_0000 ─ 0x0009_fc00)  [0x0010_0000 ──────────────── 0x1000_0000)
//! Reserved   [0x0000_0000 ───── 0x0010_0000)  [0x0010_0000 ─ 0x0020_0000)
//!                                               kernel image
//! ```
//!
//! Within a chunk, blocks stay sorted by base and never overlap: every insert
//! is followed by a coalescing pass that merges blocks which overlap or touch.
//! A chunk holds at most [`MAX_BLOCKS`] entries; running out is fatal for the
//! panicking entry points.

use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, checked_align_up};
use log::{debug, trace};

/// Capacity of one chunk.
pub const MAX_BLOCKS: usize = 32;

/// A half-open physical range `[base, base + size)`.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct MemBlock {
    pub base: PhysicalAddress,
    pub size: u64,
}

impl MemBlock {
    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, size: u64) -> Self {
        Self { base, size }
    }

    /// Exclusive end, saturating at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.size)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.base.as_u64() && pa.as_u64() < self.end()
    }

    /// `true` if `[base, base + size)` shares at least one byte with this block.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, base: PhysicalAddress, size: u64) -> bool {
        let end = base.as_u64().saturating_add(size);
        size != 0 && base.as_u64() < self.end() && self.base.as_u64() < end
    }
}

impl fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base.as_u64(), self.end())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChunkError {
    #[error("{chunk}: nBlock > 32")]
    CapacityExceeded { chunk: &'static str },
}

/// A sorted, coalesced list of at most [`MAX_BLOCKS`] ranges.
#[derive(Clone)]
pub struct MemChunk {
    name: &'static str,
    blocks: [MemBlock; MAX_BLOCKS],
    len: usize,
}

impl MemChunk {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            blocks: [MemBlock::new(PhysicalAddress::zero(), 0); MAX_BLOCKS],
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn blocks(&self) -> &[MemBlock] {
        &self.blocks[..self.len]
    }

    /// Restartable iteration in base-address order.
    pub fn iter(&self) -> core::iter::Copied<core::slice::Iter<'_, MemBlock>> {
        self.blocks().iter().copied()
    }

    /// Total number of bytes covered.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.iter().map(|b| b.size).sum()
    }

    /// Inserts `[base, base + size)` and coalesces. Zero-sized ranges are
    /// ignored.
    ///
    /// # Errors
    /// [`ChunkError::CapacityExceeded`] if the chunk is already full; the
    /// chunk is left unchanged.
    pub fn try_insert(&mut self, base: PhysicalAddress, size: u64) -> Result<(), ChunkError> {
        if size == 0 {
            return Ok(());
        }
        if self.len == MAX_BLOCKS {
            return Err(ChunkError::CapacityExceeded { chunk: self.name });
        }

        let pos = self
            .blocks()
            .iter()
            .position(|b| b.base >= base)
            .unwrap_or(self.len);
        self.blocks.copy_within(pos..self.len, pos + 1);
        self.blocks[pos] = MemBlock::new(base, size);
        self.len += 1;

        self.coalesce();
        trace!("{}: {:?}", self.name, self.blocks());
        Ok(())
    }

    /// Merges neighbours that overlap or touch. Every step either removes a
    /// block or advances, so this runs at most `2 * MAX_BLOCKS` times.
    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.len {
            let (a, b) = (self.blocks[i], self.blocks[i + 1]);
            if b.base.as_u64() <= a.end() {
                let end = a.end().max(b.end());
                self.blocks[i].size = end - a.base.as_u64();
                self.blocks.copy_within(i + 2..self.len, i + 1);
                self.len -= 1;
            } else {
                i += 1;
            }
        }
    }

    /// `true` if any block shares a byte with `[base, base + size)`.
    #[must_use]
    pub fn intersects(&self, base: PhysicalAddress, size: u64) -> bool {
        self.iter().any(|b| b.overlaps(base, size))
    }
}

impl fmt::Debug for MemChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemChunk")
            .field("name", &self.name)
            .field("blocks", &self.blocks())
            .finish()
    }
}

/// Source of truth for "is this physical address usable".
#[derive(Debug, Clone)]
pub struct RegionTracker {
    available: MemChunk,
    reserved: MemChunk,
}

impl Default for RegionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            available: MemChunk::new("Available"),
            reserved: MemChunk::new("Reserved"),
        }
    }

    #[inline]
    #[must_use]
    pub const fn available(&self) -> &MemChunk {
        &self.available
    }

    #[inline]
    #[must_use]
    pub const fn reserved(&self) -> &MemChunk {
        &self.reserved
    }

    /// # Errors
    /// See [`MemChunk::try_insert`].
    pub fn try_add_available(&mut self, base: PhysicalAddress, size: u64) -> Result<(), ChunkError> {
        self.available.try_insert(base, size)
    }

    /// # Errors
    /// See [`MemChunk::try_insert`].
    pub fn try_add_reserved(&mut self, base: PhysicalAddress, size: u64) -> Result<(), ChunkError> {
        self.reserved.try_insert(base, size)
    }

    /// Records usable RAM.
    ///
    /// # Panics
    /// When the chunk has no free slot left.
    pub fn add_available(&mut self, base: PhysicalAddress, size: u64) {
        debug!("available {base} + {size:#x}");
        if let Err(err) = self.try_add_available(base, size) {
            panic!("{err}");
        }
    }

    /// Carves a range out of usable RAM.
    ///
    /// # Panics
    /// When the chunk has no free slot left.
    pub fn add_reserved(&mut self, base: PhysicalAddress, size: u64) {
        debug!("reserve {base} + {size:#x}");
        if let Err(err) = self.try_add_reserved(base, size) {
            panic!("{err}");
        }
    }

    #[must_use]
    pub fn intersects_reserved(&self, base: PhysicalAddress, size: u64) -> bool {
        self.reserved.intersects(base, size)
    }

    /// Lowest available base and highest available end.
    #[must_use]
    pub fn span(&self) -> Option<MemBlock> {
        let first = self.available.blocks().first()?;
        let last = self.available.blocks().last()?;
        Some(MemBlock::new(first.base, last.end() - first.base.as_u64()))
    }

    /// Available bytes not covered by a reserved range.
    #[must_use]
    pub fn total_available(&self) -> u64 {
        self.available
            .iter()
            .map(|a| {
                let covered: u64 = self
                    .reserved
                    .iter()
                    .map(|r| a.end().min(r.end()).saturating_sub(a.base.as_u64().max(r.base.as_u64())))
                    .sum();
                a.size - covered
            })
            .sum()
    }

    /// First `align`-aligned window of `nbytes` inside available RAM that
    /// does not touch a reserved range.
    #[must_use]
    pub fn find_free(&self, nbytes: u64, align: u64) -> Option<PhysicalAddress> {
        self.find_free_below(nbytes, align, u64::MAX)
    }

    /// Like [`find_free`](Self::find_free), but the window must end at or
    /// below `ceiling`.
    ///
    /// Each available block is overlaid with the gaps between reserved
    /// blocks: `[0, r0)`, `[r0.end, r1)`, …, `[r_last.end, u64::MAX)`.
    #[must_use]
    pub fn find_free_below(&self, nbytes: u64, align: u64, ceiling: u64) -> Option<PhysicalAddress> {
        if nbytes == 0 {
            return None;
        }
        let reserved = self.reserved.blocks();
        for block in self.available.iter() {
            for i in 0..=reserved.len() {
                let gap_start = if i == 0 { 0 } else { reserved[i - 1].end() };
                let gap_end = if i == reserved.len() {
                    u64::MAX
                } else {
                    reserved[i].base.as_u64()
                };

                let end = gap_end.min(block.end()).min(ceiling);
                let Some(start) = checked_align_up(gap_start.max(block.base.as_u64()), align) else {
                    continue;
                };
                if start <= end && end - start >= nbytes {
                    return Some(PhysicalAddress::new(start));
                }
            }
        }
        None
    }

    /// Logs both chunks at debug level.
    pub fn dump(&self) {
        for chunk in [&self.available, &self.reserved] {
            debug!("{} ({} blocks, {:#x} bytes)", chunk.name(), chunk.len(), chunk.total());
            for block in chunk.iter() {
                debug!("  {block:?}");
            }
        }
    }
}
