//! # RSDP/XSDP (Root/Extended System Description Pointer)

use crate::sdt::{RootKind, RootTable};
use crate::{AcpiError, PhysMapRo, read_u32, read_u64, sum};
use log::warn;

/// Size of the ACPI 1.0 structure covered by the first checksum.
const V1_LEN: usize = 20;

/// Size of the ACPI 2.0 structure.
const V2_LEN: usize = 36;

/// A validated root pointer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Rsdp {
    revision: u8,
    oem_id: [u8; 6],
    rsdt_addr: u32,
    xsdt_addr: Option<u64>,
}

impl Rsdp {
    pub const SIGNATURE: &'static [u8; 8] = b"RSD PTR ";

    /// Validates a root pointer given as bytes, e.g. the copy the bootloader
    /// places in a multiboot2 tag.
    ///
    /// The first 20 bytes must sum to zero; for revision 2 and later the
    /// whole `length` bytes must too.
    ///
    /// # Errors
    /// [`AcpiError::Truncated`], [`AcpiError::BadSignature`] or
    /// [`AcpiError::BadChecksum`].
    pub fn parse(bytes: &[u8]) -> Result<Self, AcpiError> {
        let truncated = AcpiError::Truncated {
            what: "RSDP",
            len: bytes.len(),
        };
        let v1 = bytes.get(..V1_LEN).ok_or(truncated)?;
        if &v1[..8] != Self::SIGNATURE {
            return Err(AcpiError::BadSignature);
        }
        if sum(v1) != 0 {
            return Err(AcpiError::BadChecksum("RSDP"));
        }

        let mut oem_id = [0; 6];
        oem_id.copy_from_slice(&v1[9..15]);
        let revision = v1[15];
        let rsdt_addr = read_u32(v1, 16).ok_or(truncated)?;

        let xsdt_addr = if revision >= 2 {
            let len = read_u32(bytes, 20).ok_or(truncated)? as usize;
            let full = bytes.get(..len.max(V2_LEN)).ok_or(truncated)?;
            if sum(full) != 0 {
                return Err(AcpiError::BadChecksum("XSDP"));
            }
            read_u64(full, 24).filter(|&addr| addr != 0)
        } else {
            None
        };

        Ok(Self {
            revision,
            oem_id,
            rsdt_addr,
            xsdt_addr,
        })
    }

    /// The extended pointer if it validates, the legacy one otherwise.
    ///
    /// # Errors
    /// [`AcpiError::NoRoot`] if neither validates.
    pub fn select(xsdp: Option<&[u8]>, rsdp: Option<&[u8]>) -> Result<Self, AcpiError> {
        let parse = |bytes: &[u8]| {
            Self::parse(bytes)
                .map_err(|err| warn!("ignoring root pointer: {err}"))
                .ok()
        };
        xsdp.and_then(parse)
            .or_else(|| rsdp.and_then(parse))
            .ok_or(AcpiError::NoRoot)
    }

    /// Validates a root pointer in physical memory.
    ///
    /// # Errors
    /// As [`parse`](Self::parse), or [`AcpiError::Unmapped`].
    ///
    /// # Safety
    /// `map` must hand out slices that stay valid while this runs.
    pub unsafe fn from_phys(map: &impl PhysMapRo, paddr: u64) -> Result<Self, AcpiError> {
        let unmapped = |len| AcpiError::Unmapped { paddr, len };
        let v1 = unsafe { map.map_ro(paddr, V1_LEN) }.ok_or(unmapped(V1_LEN))?;
        if v1.get(15).is_some_and(|&rev| rev >= 2) {
            let v2 = unsafe { map.map_ro(paddr, V2_LEN) }.ok_or(unmapped(V2_LEN))?;
            let len = (read_u32(v2, 20).unwrap_or(0) as usize).max(V2_LEN);
            let full = unsafe { map.map_ro(paddr, len) }.ok_or(unmapped(len))?;
            return Self::parse(full);
        }
        Self::parse(v1)
    }

    #[must_use]
    pub const fn revision(&self) -> u8 {
        self.revision
    }

    /// `true` when an XSDT address is available.
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        self.xsdt_addr.is_some()
    }

    #[must_use]
    pub fn oem_id(&self) -> &str {
        core::str::from_utf8(&self.oem_id).unwrap_or("?").trim_end()
    }

    #[must_use]
    pub const fn rsdt_addr(&self) -> u32 {
        self.rsdt_addr
    }

    #[must_use]
    pub const fn xsdt_addr(&self) -> Option<u64> {
        self.xsdt_addr
    }

    /// XSDT if present, RSDT otherwise.
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn root_table(&self) -> RootTable {
        match self.xsdt_addr {
            Some(addr) => RootTable::new(RootKind::Xsdt, addr),
            None => RootTable::new(RootKind::Rsdt, self.rsdt_addr as u64),
        }
    }
}
