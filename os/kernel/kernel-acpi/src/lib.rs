//! # ACPI (Advanced Configuration and Power Interface) Support
//!
//! Early-boot discovery of the firmware tables the kernel needs before it can
//! pick a timer and bring up the local APIC.
//!
//! ```text
//! multiboot2 tag 15 / 14
//!     ↓
//! XSDP / RSDP          "RSD PTR ", checksum, revision
//!     ↓
//! XSDT (u64 entries) or RSDT (u32 entries)
//!     ↓
//! "APIC" (MADT)   "HPET"   ...
//! ```
//!
//! The bootloader hands over a *copy* of the root pointer, so [`rsdp`] parses
//! plain bytes. Everything below it lives in physical memory and is reached
//! through [`PhysMapRo`].
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_acpi::{Acpi, PhysMapRo, rsdp::Rsdp};
//!
//! struct Identity;
//! impl PhysMapRo for Identity {
//!     unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> Option<&'a [u8]> {
//!         Some(unsafe { core::slice::from_raw_parts(paddr as *const u8, len) })
//!     }
//! }
//!
//! # let (xsdp, rsdp): (Option<&[u8]>, Option<&[u8]>) = (None, None);
//! let root = Rsdp::select(xsdp, rsdp).expect("no acpi table");
//! let acpi = Acpi::new(&Identity, &root);
//! if let Some(madt) = acpi.madt() {
//!     for cpu in madt.processors() {
//!         println!("cpu {}", cpu.apic_id);
//!     }
//! }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod hpet;
pub mod madt;
pub mod rsdp;
pub mod sdt;

use crate::hpet::HpetTable;
use crate::madt::Madt;
use crate::rsdp::Rsdp;
use crate::sdt::{RootTable, Table};
use log::{debug, info, warn};

/// Map a physical region and return a *read-only* byte slice for its contents.
/// You provide the implementation (direct map, ioremap, host buffer in tests).
pub trait PhysMapRo {
    /// `None` if the range cannot be made accessible.
    ///
    /// # Safety
    /// The implementor must ensure the returned slice is valid for `len` bytes
    /// for as long as `'a`.
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> Option<&'a [u8]>;
}

impl<T: PhysMapRo + ?Sized> PhysMapRo for &T {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> Option<&'a [u8]> {
        unsafe { (**self).map_ro(paddr, len) }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AcpiError {
    #[error("no acpi table")]
    NoRoot,
    #[error("bad signature")]
    BadSignature,
    #[error("checksum mismatch in {0}")]
    BadChecksum(&'static str),
    #[error("{what} truncated: {len} bytes")]
    Truncated { what: &'static str, len: usize },
    #[error("cannot map {len:#x} bytes at {paddr:#x}")]
    Unmapped { paddr: u64, len: usize },
}

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |a, &b| a.wrapping_add(b))
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw = bytes.get(offset..offset.checked_add(2)?)?;
    raw.try_into().ok().map(u16::from_le_bytes)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    raw.try_into().ok().map(u32::from_le_bytes)
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset.checked_add(8)?)?;
    raw.try_into().ok().map(u64::from_le_bytes)
}

/// Table lookup over the root table selected at boot.
pub struct Acpi<'m, M: PhysMapRo> {
    map: &'m M,
    root: RootTable,
}

impl<'m, M: PhysMapRo> Acpi<'m, M> {
    /// Uses the XSDT when the root pointer carries one, the RSDT otherwise.
    pub fn new(map: &'m M, rsdp: &Rsdp) -> Self {
        let root = rsdp.root_table();
        info!(
            "found acpi table version{} ({}), {:?} at {:#x}",
            if rsdp.is_extended() { 2 } else { 1 },
            rsdp.oem_id(),
            root.kind(),
            root.address()
        );
        Self { map, root }
    }

    #[must_use]
    pub const fn root(&self) -> RootTable {
        self.root
    }

    /// Every table the root points at, in root-table order. Entries that
    /// cannot be mapped or fail their checksum are skipped with a warning.
    pub fn tables(&self) -> impl Iterator<Item = Table<'m>> + '_ {
        self.root.entries(self.map).filter_map(|pa| {
            // SAFETY: addresses come from a checksummed root table.
            match unsafe { Table::load(self.map, pa) } {
                Ok(table) => Some(table),
                Err(err) => {
                    warn!("skipping table at {pa:#x}: {err}");
                    None
                }
            }
        })
    }

    /// First table with the 4-byte `signature`.
    #[must_use]
    pub fn find(&self, signature: &[u8; 4]) -> Option<Table<'m>> {
        self.tables().find(|t| &t.header().signature == signature)
    }

    #[must_use]
    pub fn madt(&self) -> Option<Madt<'m>> {
        self.find(Madt::SIGNATURE)
            .and_then(|t| Madt::parse(t).map_err(|err| warn!("MADT: {err}")).ok())
    }

    #[must_use]
    pub fn hpet(&self) -> Option<HpetTable> {
        self.find(HpetTable::SIGNATURE)
            .and_then(|t| HpetTable::parse(&t).map_err(|err| warn!("HPET: {err}")).ok())
    }

    /// Logs every table header at debug level.
    pub fn dump(&self) {
        info!("ACPI {:?}:", self.root.kind());
        for table in self.tables() {
            let h = table.header();
            debug!(
                "  {} ({} {}) at {:#x}",
                h.signature_str(),
                h.oem_id_str(),
                h.oem_table_id_str(),
                table.address()
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic firmware tables in host memory.

    use super::PhysMapRo;
    use std::cell::RefCell;

    /// Physical memory made of disjoint byte regions.
    #[derive(Default)]
    pub struct FakeMemory {
        regions: RefCell<Vec<(u64, &'static [u8])>>,
    }

    impl FakeMemory {
        pub fn place(&self, paddr: u64, bytes: Vec<u8>) {
            self.regions.borrow_mut().push((paddr, Vec::leak(bytes)));
        }
    }

    impl PhysMapRo for FakeMemory {
        unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> Option<&'a [u8]> {
            self.regions.borrow().iter().find_map(|&(base, bytes)| {
                let start = usize::try_from(paddr.checked_sub(base)?).ok()?;
                bytes.get(start..start.checked_add(len)?)
            })
        }
    }

    /// Fixes up byte 9 so the whole table sums to zero.
    pub fn table(signature: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let len = u32::try_from(36 + body.len()).unwrap();
        let mut t = Vec::with_capacity(len as usize);
        t.extend_from_slice(signature);
        t.extend_from_slice(&len.to_le_bytes());
        t.push(1); // revision
        t.push(0); // checksum
        t.extend_from_slice(b"BOCHS ");
        t.extend_from_slice(b"BXPC    ");
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(b"BXPC");
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(body);
        t[9] = 0u8.wrapping_sub(super::sum(&t));
        t
    }

    /// A root pointer; revision 2 adds the XSDP extension.
    pub fn rsdp(revision: u8, rsdt: u32, xsdt: u64) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(b"RSD PTR ");
        r.push(0);
        r.extend_from_slice(b"BOCHS ");
        r.push(revision);
        r.extend_from_slice(&rsdt.to_le_bytes());
        r[8] = 0u8.wrapping_sub(super::sum(&r));
        if revision >= 2 {
            r.extend_from_slice(&36u32.to_le_bytes());
            r.extend_from_slice(&xsdt.to_le_bytes());
            r.push(0);
            r.extend_from_slice(&[0; 3]);
            r[32] = 0u8.wrapping_sub(super::sum(&r));
        }
        r
    }
}
