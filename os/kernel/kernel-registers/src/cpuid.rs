//! # CPUID
//!
//! [`Cpuid`] is the seam between feature detection and the instruction.
//! [`NativeCpuid`] executes it; tests substitute a table.

/// Raw register output of one `CPUID` invocation.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Leaf numbers the kernel queries.
pub mod leaf {
    pub const VENDOR: u32 = 0x0;
    pub const FEATURES: u32 = 0x1;
    pub const EXT_MAX: u32 = 0x8000_0000;
    pub const EXT_FEATURES: u32 = 0x8000_0001;
    pub const BRAND_0: u32 = 0x8000_0002;
    pub const BRAND_2: u32 = 0x8000_0004;
}

/// Source of `CPUID` results.
pub trait Cpuid {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// The 12-byte vendor identification string from leaf 0.
    fn vendor(&self) -> [u8; 12] {
        let r = self.cpuid(leaf::VENDOR, 0);
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&r.ebx.to_le_bytes());
        out[4..8].copy_from_slice(&r.edx.to_le_bytes());
        out[8..12].copy_from_slice(&r.ecx.to_le_bytes());
        out
    }

    fn max_extended_leaf(&self) -> u32 {
        self.cpuid(leaf::EXT_MAX, 0).eax
    }

    /// CPUID.1:ECX\[21\].
    fn has_x2apic(&self) -> bool {
        self.cpuid(leaf::FEATURES, 0).ecx & (1 << 21) != 0
    }

    /// CPUID.1:EDX\[9\].
    fn has_apic(&self) -> bool {
        self.cpuid(leaf::FEATURES, 0).edx & (1 << 9) != 0
    }

    /// CPUID.8000_0001:EDX\[20\].
    fn has_nx(&self) -> bool {
        self.max_extended_leaf() >= leaf::EXT_FEATURES
            && self.cpuid(leaf::EXT_FEATURES, 0).edx & (1 << 20) != 0
    }
}

/// Executes the `CPUID` instruction.
#[derive(Debug, Copy, Clone, Default)]
pub struct NativeCpuid;

#[cfg(feature = "asm")]
impl Cpuid for NativeCpuid {
    #[allow(unused_assignments)]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let (mut eax, mut ebx, mut ecx, mut edx) = (leaf, 0u32, subleaf, 0u32);
        // SAFETY: CPUID is unprivileged and available on every x86-64 CPU.
        // rbx is reserved by LLVM, so it is saved around the instruction.
        unsafe {
            core::arch::asm!(
                "push rbx",
                "cpuid",
                "mov {ebx_out:e}, ebx",
                "pop rbx",
                ebx_out = lateout(reg) ebx,
                inlateout("eax") eax,
                inlateout("ecx") ecx,
                lateout("edx") edx,
                options(nomem, preserves_flags),
            );
        }
        CpuidResult { eax, ebx, ecx, edx }
    }
}
