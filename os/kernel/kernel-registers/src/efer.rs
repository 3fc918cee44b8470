use crate::msr::Msr;
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// `IA32_EFER` (MSR `0xC000_0080`).
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0 (SCE): `SYSCALL`/`SYSRET` enable.
    pub sce: bool,

    #[bits(7)]
    __: u8,

    /// Bit 8 (LME): Long Mode Enable.
    pub lme: bool,

    #[bits(1)]
    __: u8,

    /// Bit 10 (LMA): Long Mode Active (read-only).
    pub lma: bool,

    /// Bit 11 (NXE): No-Execute Enable.
    ///
    /// When clear, bit 63 of a page table entry is reserved and setting it
    /// faults, so the paging code must not emit it.
    pub nxe: bool,

    #[bits(52)]
    __: u64,
}

impl Efer {
    pub const MSR: Msr = Msr::EFER;
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Efer {
    unsafe fn load_unsafe() -> Self {
        Self::from_bits(unsafe { Self::MSR.load_raw() })
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Efer {
    unsafe fn store_unsafe(self) {
        unsafe { Self::MSR.store_raw(self.into_bits()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_mode_with_nx() {
        let efer = Efer::from_bits(0xd01);
        assert!(efer.sce());
        assert!(efer.lme());
        assert!(efer.lma());
        assert!(efer.nxe());
    }

    #[test]
    fn nx_is_bit_11() {
        assert_eq!(Efer::new().with_nxe(true).into_bits(), 1 << 11);
    }
}
