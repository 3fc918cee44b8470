//! # CPU Vendor Dispatch
//!
//! Matches the `CPUID` vendor string against the known vendors and runs the
//! vendor's init, which for now reports the processor brand string.

use core::fmt;
use kernel_registers::cpuid::{Cpuid, leaf};
use log::info;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CpuVendor {
    Amd,
    Intel,
}

/// Vendor strings as returned in EBX, EDX, ECX of leaf 0.
const VENDOR_IDS: &[(CpuVendor, &[u8; 12])] = &[
    (CpuVendor::Amd, b"AuthenticAMD"),
    (CpuVendor::Amd, b"AMDisbetter!"),
    (CpuVendor::Intel, b"GenuineIntel"),
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CpuError {
    #[error("cannot find processor")]
    UnknownVendor([u8; 12]),
}

impl CpuVendor {
    #[must_use]
    pub fn from_id(id: &[u8; 12]) -> Option<Self> {
        VENDOR_IDS
            .iter()
            .find(|(_, known)| *known == id)
            .map(|&(vendor, _)| vendor)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Amd => "AMD",
            Self::Intel => "Intel",
        }
    }

    /// Vendor-specific bring-up. Both vendors expose the brand string through
    /// the same extended leaves.
    pub fn init(self, cpuid: &impl Cpuid) -> Option<BrandString> {
        let brand = BrandString::read(cpuid);
        if let Some(brand) = &brand {
            info!("{}: Processor: {brand}", self.name());
        }
        brand
    }
}

/// The 48-byte processor name from leaves `0x8000_0002..=0x8000_0004`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct BrandString([u8; 48]);

impl BrandString {
    /// `None` when the CPU does not implement the brand leaves.
    #[must_use]
    pub fn read(cpuid: &impl Cpuid) -> Option<Self> {
        if cpuid.max_extended_leaf() < leaf::BRAND_2 {
            return None;
        }
        let mut bytes = [0u8; 48];
        for (chunk, l) in bytes.chunks_exact_mut(16).zip(leaf::BRAND_0..=leaf::BRAND_2) {
            let r = cpuid.cpuid(l, 0);
            for (dst, reg) in chunk.chunks_exact_mut(4).zip([r.eax, r.ebx, r.ecx, r.edx]) {
                dst.copy_from_slice(&reg.to_le_bytes());
            }
        }
        Some(Self(bytes))
    }

    /// Up to the first NUL, without the padding vendors put around it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        core::str::from_utf8(&self.0[..end]).map_or("", str::trim)
    }
}

impl fmt::Debug for BrandString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for BrandString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone)]
pub struct CpuInfo {
    pub vendor: CpuVendor,
    pub brand: Option<BrandString>,
    pub nx: bool,
}

/// Identifies the boot CPU and runs its vendor init.
///
/// # Errors
/// [`CpuError::UnknownVendor`] for a vendor string not in the table.
pub fn identify(cpuid: &impl Cpuid) -> Result<CpuInfo, CpuError> {
    let id = cpuid.vendor();
    info!("CPU Vendor: {}", core::str::from_utf8(&id).unwrap_or("?"));

    let vendor = CpuVendor::from_id(&id).ok_or(CpuError::UnknownVendor(id))?;
    info!("Vendor: {}", vendor.name());

    let brand = vendor.init(cpuid);
    Ok(CpuInfo {
        vendor,
        brand,
        nx: cpuid.has_nx(),
    })
}
