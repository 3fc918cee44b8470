use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A 64-bit x86-64 page table entry, valid at every level.
///
/// | Bits   | Field            |
/// |--------|------------------|
/// | 0      | present          |
/// | 1      | writable         |
/// | 2      | user             |
/// | 3      | write-through    |
/// | 4      | cache disabled   |
/// | 5      | accessed         |
/// | 6      | dirty            |
/// | 7      | huge (PS)        |
/// | 8      | global           |
/// | 9–11   | OS available     |
/// | 12–51  | frame            |
/// | 52–62  | ignored / PKU    |
/// | 63     | no-execute       |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageTableEntry;
/// let e = PageTableEntry::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_frame(PhysicalAddress::new(0x20_1000));
/// assert_eq!(e.into_bits(), 0x20_1003);
/// ```
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// `PS`: maps a 2 MiB (L2) or 1 GiB (L3) page instead of pointing to a table.
    pub huge: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available: u8,
    #[bits(40)]
    frame_number: u64,
    #[bits(11)]
    __: u16,
    /// Execute disable. Reserved (faults) unless `EFER.NXE` is set.
    pub no_execute: bool,
}

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Non-leaf entry pointing at the table in `frame`.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(frame)
    }

    /// Physical frame this entry points to (bits 12..52).
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_number() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalAddress) -> Self {
        self.with_frame_number(frame.as_u64() >> 12)
    }

    #[inline]
    pub fn set_frame(&mut self, frame: PhysicalAddress) {
        self.set_frame_number(frame.as_u64() >> 12);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nx_is_bit_63() {
        let e = PageTableEntry::new().with_no_execute(true);
        assert_eq!(e.into_bits(), 1 << 63);
    }

    #[test]
    fn frame_ignores_flag_bits() {
        let e = PageTableEntry::from_bits(0x8000_0000_0040_2063);
        assert_eq!(e.frame(), PhysicalAddress::new(0x40_2000));
        assert!(e.present() && e.writable() && e.accessed() && e.dirty());
        assert!(e.no_execute());
        assert!(!e.user());
    }

    #[test]
    fn table_entry_is_present_and_writable() {
        let e = PageTableEntry::table(PhysicalAddress::new(0x5000), false);
        assert_eq!(e.into_bits(), 0x5003);
        let u = PageTableEntry::table(PhysicalAddress::new(0x5000), true);
        assert_eq!(u.into_bits(), 0x5007);
    }
}
