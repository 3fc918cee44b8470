use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: root of the active 4-level page table hierarchy (PCID disabled).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Cr3 {
    #[bits(3)]
    __: u8,

    /// Bit 3: write-through for accesses to the root table.
    pub pwt: bool,

    /// Bit 4: cache disable for accesses to the root table.
    pub pcd: bool,

    #[bits(7)]
    __: u8,

    /// Bits 12..52: root table frame number.
    #[bits(40)]
    root_frame: u64,

    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value selecting the page-aligned root table at `root`.
    #[must_use]
    pub fn from_root(root: PhysicalAddress) -> Self {
        debug_assert!(root.is_page_aligned(), "root table must be 4K-aligned");
        Self::new().with_root_frame(root.as_u64() >> 12)
    }

    /// Physical address of the root table.
    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_frame() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

/// Reloads CR3 with its current value, flushing all non-global TLB entries.
///
/// # Safety
/// Ring 0 only.
#[cfg(feature = "asm")]
pub unsafe fn flush_tlb() {
    unsafe {
        let cr3 = Cr3::load_unsafe();
        cr3.store_unsafe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_stored_in_bits_12_to_51() {
        let cr3 = Cr3::from_root(PhysicalAddress::new(0x0012_3000));
        assert_eq!(cr3.into_bits(), 0x0012_3000);
        assert_eq!(cr3.root(), PhysicalAddress::new(0x0012_3000));
        assert!(!cr3.pcd());
    }

    #[test]
    fn flags_do_not_leak_into_root() {
        let cr3 = Cr3::from_bits(0x0040_0018);
        assert!(cr3.pwt());
        assert!(cr3.pcd());
        assert_eq!(cr3.root().as_u64(), 0x0040_0000);
    }
}
