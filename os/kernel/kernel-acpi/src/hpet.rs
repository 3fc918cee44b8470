//! # HPET Description Table
//!
//! Signature `"HPET"`: event timer block id, register base as a generic
//! address structure, sequence number, minimum periodic tick and page
//! protection flags.

use crate::sdt::Table;
use crate::{AcpiError, read_u16, read_u32, read_u64};

/// ACPI Generic Address Structure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GenericAddress {
    pub space_id: u8,
    pub bit_width: u8,
    pub bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

impl GenericAddress {
    pub const SPACE_SYSTEM_MEMORY: u8 = 0;
    pub const SPACE_SYSTEM_IO: u8 = 1;
    pub const SPACE_PCI_CONFIG: u8 = 2;

    fn parse(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            space_id: *bytes.first()?,
            bit_width: *bytes.get(1)?,
            bit_offset: *bytes.get(2)?,
            access_size: *bytes.get(3)?,
            address: read_u64(bytes, 4)?,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HpetTable {
    pub hardware_id: u32,
    pub address: GenericAddress,
    pub number: u8,
    pub min_tick: u16,
    pub flags: u8,
}

impl HpetTable {
    pub const SIGNATURE: &'static [u8; 4] = b"HPET";

    /// # Errors
    /// [`AcpiError::BadSignature`] for a different table,
    /// [`AcpiError::Truncated`] if the body is shorter than 20 bytes.
    pub fn parse(table: &Table<'_>) -> Result<Self, AcpiError> {
        if &table.header().signature != Self::SIGNATURE {
            return Err(AcpiError::BadSignature);
        }
        let body = table.body();
        let parse = || {
            Some(Self {
                hardware_id: read_u32(body, 0)?,
                address: GenericAddress::parse(body.get(4..16)?)?,
                number: *body.get(16)?,
                min_tick: read_u16(body, 17)?,
                flags: *body.get(19)?,
            })
        };
        parse().ok_or(AcpiError::Truncated {
            what: "HPET",
            len: body.len(),
        })
    }

    /// Register block base, if it is memory-mapped.
    #[must_use]
    pub const fn mmio_base(&self) -> Option<u64> {
        if self.address.space_id == GenericAddress::SPACE_SYSTEM_MEMORY && self.address.address != 0 {
            Some(self.address.address)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn pci_vendor_id(&self) -> u16 {
        (self.hardware_id >> 16) as u16
    }

    /// Number of comparators in the first timer block.
    #[must_use]
    pub const fn comparators(&self) -> u8 {
        (((self.hardware_id >> 8) & 0x1f) + 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::table;

    fn qemu_hpet() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x8086_a201u32.to_le_bytes());
        body.extend_from_slice(&[0, 64, 0, 0]);
        body.extend_from_slice(&0xfed0_0000u64.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&0x80u16.to_le_bytes());
        body.push(0);
        table(b"HPET", &body)
    }

    #[test]
    fn qemu_table_decodes() {
        let bytes = qemu_hpet();
        let hpet = HpetTable::parse(&Table::from_bytes(0, &bytes).unwrap()).unwrap();
        assert_eq!(hpet.mmio_base(), Some(0xfed0_0000));
        assert_eq!(hpet.address.bit_width, 64);
        assert_eq!(hpet.pci_vendor_id(), 0x8086);
        assert_eq!(hpet.comparators(), 3);
        assert_eq!(hpet.min_tick, 0x80);
        assert_eq!(hpet.number, 0);
    }

    #[test]
    fn io_space_has_no_mmio_base() {
        let mut bytes = qemu_hpet();
        bytes[40] = GenericAddress::SPACE_SYSTEM_IO;
        bytes[9] = bytes[9].wrapping_sub(1);
        let hpet = HpetTable::parse(&Table::from_bytes(0, &bytes).unwrap()).unwrap();
        assert_eq!(hpet.mmio_base(), None);
    }

    #[test]
    fn short_body_is_truncated() {
        let bytes = table(b"HPET", &[0; 12]);
        assert!(matches!(
            HpetTable::parse(&Table::from_bytes(0, &bytes).unwrap()),
            Err(AcpiError::Truncated { what: "HPET", len: 12 })
        ));
    }
}
