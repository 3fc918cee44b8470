use crate::msr::Msr;
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// `IA32_APIC_BASE` (MSR `0x1B`).
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct ApicBase {
    #[bits(8)]
    __: u8,

    /// Bit 8 (BSP): set on the bootstrap processor (read-only).
    pub bsp: bool,

    #[bits(1)]
    __: u8,

    /// Bit 10 (EXTD): x2APIC mode enable.
    pub x2apic_enable: bool,

    /// Bit 11 (EN): APIC global enable.
    pub global_enable: bool,

    /// Bits 12..52: APIC MMIO base frame.
    #[bits(40)]
    base_frame: u64,

    #[bits(12)]
    __: u16,
}

impl ApicBase {
    pub const MSR: Msr = Msr::APIC_BASE;

    /// Physical base of the xAPIC register page.
    #[must_use]
    pub fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base_frame() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for ApicBase {
    unsafe fn load_unsafe() -> Self {
        Self::from_bits(unsafe { Self::MSR.load_raw() })
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for ApicBase {
    unsafe fn store_unsafe(self) {
        unsafe { Self::MSR.store_raw(self.into_bits()) }
    }
}
