//! # Model-Specific Registers
//!
//! Raw `RDMSR`/`WRMSR` access plus the typed `IA32_APIC_BASE` register used
//! when enabling the local APIC.

mod apic_base;

pub use apic_base::ApicBase;

/// Identifies a **Model-Specific Register (MSR)** by its architectural index.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    /// `IA32_APIC_BASE`.
    pub const APIC_BASE: Self = Self(0x1b);

    /// First MSR of the x2APIC register window.
    pub const X2APIC_BASE: Self = Self(0x800);

    /// `IA32_EFER`.
    pub const EFER: Self = Self(0xC000_0080);

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The x2APIC MSR for the xAPIC MMIO register at byte offset `reg`.
    #[inline]
    #[must_use]
    pub const fn x2apic(reg: u32) -> Self {
        Self(Self::X2APIC_BASE.0 + (reg >> 4))
    }

    /// Write a 64-bit value to this MSR.
    ///
    /// # Safety
    /// `WRMSR` is privileged (CPL 0) and faults on an invalid or reserved
    /// MSR. The caller is responsible for the architectural side effects of
    /// the write.
    #[cfg(feature = "asm")]
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn store_raw(self, val: u64) {
        let lo = (val & 0xFFFF_FFFF) as u32;
        let hi = (val >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") self.0,
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags)
            );
        }
    }

    /// Read the 64-bit value of this MSR.
    ///
    /// # Safety
    /// `RDMSR` is privileged (CPL 0) and faults on an invalid MSR.
    #[cfg(feature = "asm")]
    #[inline]
    #[must_use]
    pub unsafe fn load_raw(self) -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") self.0,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}
