use crate::PageTableEntry;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Height of the table tree (4-level paging).
pub const LEVELS: u8 = 4;

/// Level whose entries map 4 KiB pages.
pub const LOWEST_LEVEL: u8 = 1;

/// Index of `va` in a level-`level` table: `(va >> (12 + (level-1)*9)) & 0x1ff`.
///
/// ```rust
/// # use kernel_memory_addresses::VirtualAddress;
/// # use kernel_vmem::table_index;
/// let va = VirtualAddress::new(0xffff_8000_0020_1000);
/// assert_eq!(table_index(4, va), 256);
/// assert_eq!(table_index(2, va), 1);
/// assert_eq!(table_index(1, va), 1);
/// ```
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
pub const fn table_index(level: u8, va: VirtualAddress) -> usize {
    debug_assert!(level >= LOWEST_LEVEL && level <= LEVELS);
    ((va.as_u64() >> (12 + (level as u32 - 1) * 9)) & 0x1ff) as usize
}

/// Bytes covered by one entry of a level-`level` table.
#[inline]
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn level_span(level: u8) -> u64 {
    1 << (12 + (level as u32 - 1) * 9)
}

/// One 4 KiB page table, valid at every level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_per_level() {
        assert_eq!(level_span(1), 0x1000);
        assert_eq!(level_span(2), 0x20_0000);
        assert_eq!(level_span(3), 0x4000_0000);
        assert_eq!(level_span(4), 0x80_0000_0000);
    }

    #[test]
    fn kernel_link_indices() {
        let va = VirtualAddress::new(0xffff_ffff_8010_0000);
        assert_eq!(table_index(4, va), 511);
        assert_eq!(table_index(3, va), 510);
        assert_eq!(table_index(2, va), 0);
        assert_eq!(table_index(1, va), 256);
    }
}
