//! # Local APIC
//!
//! The bootstrap processor's local APIC, driven either through its MMIO page
//! (xAPIC) or through MSRs (x2APIC). Registers are named by their xAPIC byte
//! offset in both modes; x2APIC maps offset `reg` to MSR `0x800 + reg / 16`.

use crate::ProbeError;
use crate::mmio::RegisterBlock;
use kernel_memory_addresses::PAGE_SIZE;
use kernel_registers::cpuid::Cpuid;
use kernel_registers::msr::{ApicBase, Msr};
use log::{debug, info};

/// Register offsets.
pub mod reg {
    pub const ID: u32 = 0x020;
    pub const VERSION: u32 = 0x030;
    pub const TPR: u32 = 0x080;
    pub const EOI: u32 = 0x0b0;
    pub const ESR: u32 = 0x280;
    pub const ICR_LOW: u32 = 0x300;
    pub const ICR_HIGH: u32 = 0x310;
}

/// Size of the xAPIC register window.
pub const XAPIC_MMIO_SIZE: u64 = PAGE_SIZE;

/// Access to model-specific registers.
pub trait MsrIo {
    /// # Safety
    /// `RDMSR` faults on MSRs the CPU does not implement.
    unsafe fn read_msr(&self, msr: Msr) -> u64;

    /// # Safety
    /// `WRMSR` changes processor state; the caller owns the consequences.
    unsafe fn write_msr(&self, msr: Msr, val: u64);
}

impl<T: MsrIo + ?Sized> MsrIo for &T {
    unsafe fn read_msr(&self, msr: Msr) -> u64 {
        unsafe { (**self).read_msr(msr) }
    }

    unsafe fn write_msr(&self, msr: Msr, val: u64) {
        unsafe { (**self).write_msr(msr, val) }
    }
}

/// `RDMSR`/`WRMSR` on the running CPU.
#[derive(Debug, Copy, Clone, Default)]
pub struct NativeMsr;

impl MsrIo for NativeMsr {
    unsafe fn read_msr(&self, msr: Msr) -> u64 {
        unsafe { msr.load_raw() }
    }

    unsafe fn write_msr(&self, msr: Msr, val: u64) {
        unsafe { msr.store_raw(val) }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ApicMode {
    XApic,
    X2Apic,
}

/// Picks the best mode the CPU offers: x2APIC, then xAPIC.
///
/// # Errors
/// [`ProbeError::NoApic`] when `CPUID` reports neither.
pub fn detect(cpuid: &impl Cpuid) -> Result<ApicMode, ProbeError> {
    if cpuid.has_x2apic() {
        debug!("apic: kernel uses x2apic");
        Ok(ApicMode::X2Apic)
    } else if cpuid.has_apic() {
        debug!("apic: kernel uses xapic");
        Ok(ApicMode::XApic)
    } else {
        Err(ProbeError::NoApic)
    }
}

/// Sets the global enable bit (and EXTD for x2APIC) in `IA32_APIC_BASE`,
/// writing the MSR only when something changes. Returns the new value; its
/// [`base`](ApicBase::base) is the xAPIC register page.
///
/// # Safety
/// Must run on the CPU whose APIC is being enabled, with `mode` supported.
#[must_use]
pub unsafe fn enable(msr: &impl MsrIo, mode: ApicMode) -> ApicBase {
    let current = ApicBase::from_bits(unsafe { msr.read_msr(ApicBase::MSR) });
    let wanted = current
        .with_global_enable(true)
        .with_x2apic_enable(current.x2apic_enable() || mode == ApicMode::X2Apic);
    if wanted != current {
        unsafe { msr.write_msr(ApicBase::MSR, wanted.into_bits()) };
    }
    wanted
}

/// xAPIC through its MMIO page.
#[derive(Debug)]
pub struct XApic<R: RegisterBlock> {
    regs: R,
}

impl<R: RegisterBlock> XApic<R> {
    #[must_use]
    pub const fn new(regs: R) -> Self {
        Self { regs }
    }

    #[must_use]
    pub fn read(&self, reg: u32) -> u32 {
        self.regs.read32(reg as usize)
    }

    /// Writes are posted; reading ID afterwards waits for completion.
    pub fn write(&self, reg: u32, val: u32) {
        self.regs.write32(reg as usize, val);
        let _ = self.regs.read32(reg::ID as usize);
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.read(reg::ID) >> 24
    }

    pub fn send_ipi(&self, dest: u32, icr_low: u32) {
        self.write(reg::ICR_HIGH, dest << 24);
        self.write(reg::ICR_LOW, icr_low);
    }
}

/// x2APIC through MSRs.
#[derive(Debug)]
pub struct X2Apic<M: MsrIo> {
    msr: M,
}

impl<M: MsrIo> X2Apic<M> {
    /// # Safety
    /// The APIC must be in x2APIC mode; see [`enable`].
    #[must_use]
    pub const unsafe fn new(msr: M) -> Self {
        Self { msr }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(&self, reg: u32) -> u32 {
        // SAFETY: x2APIC mode is a constructor precondition.
        unsafe { self.msr.read_msr(Msr::x2apic(reg)) as u32 }
    }

    pub fn write(&self, reg: u32, val: u32) {
        // SAFETY: as above.
        unsafe { self.msr.write_msr(Msr::x2apic(reg), u64::from(val)) }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.read(reg::ID)
    }

    /// ICR is a single 64-bit MSR in x2APIC mode.
    pub fn send_ipi(&self, dest: u32, icr_low: u32) {
        let icr = (u64::from(dest) << 32) | u64::from(icr_low);
        // SAFETY: as above.
        unsafe { self.msr.write_msr(Msr::x2apic(reg::ICR_LOW), icr) }
    }
}

/// The local APIC in whichever mode [`detect`] chose.
#[derive(Debug)]
pub enum LocalApic<R: RegisterBlock, M: MsrIo> {
    XApic(XApic<R>),
    X2Apic(X2Apic<M>),
}

impl<R: RegisterBlock, M: MsrIo> LocalApic<R, M> {
    #[must_use]
    pub const fn mode(&self) -> ApicMode {
        match self {
            Self::XApic(_) => ApicMode::XApic,
            Self::X2Apic(_) => ApicMode::X2Apic,
        }
    }

    #[must_use]
    pub fn read(&self, reg: u32) -> u32 {
        match self {
            Self::XApic(a) => a.read(reg),
            Self::X2Apic(a) => a.read(reg),
        }
    }

    pub fn write(&self, reg: u32, val: u32) {
        match self {
            Self::XApic(a) => a.write(reg, val),
            Self::X2Apic(a) => a.write(reg, val),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::XApic(a) => a.id(),
            Self::X2Apic(a) => a.id(),
        }
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.read(reg::VERSION).to_le_bytes()[0]
    }

    pub fn eoi(&self) {
        self.write(reg::EOI, 0);
    }

    pub fn send_ipi(&self, dest: u32, icr_low: u32) {
        match self {
            Self::XApic(a) => a.send_ipi(dest, icr_low),
            Self::X2Apic(a) => a.send_ipi(dest, icr_low),
        }
    }

    /// Clears the error status and accepts every priority class.
    pub fn init_bsp(&self) {
        self.write(reg::ESR, 0);
        self.write(reg::TPR, 0);
        info!(
            "apic: {:?} id {} version {:#x}",
            self.mode(),
            self.id(),
            self.version()
        );
    }
}
