//! # MADT (Multiple APIC Description Table)
//!
//! Signature `"APIC"`. After the common header: the local APIC base (`u32`),
//! flags (`u32`), then variable-length entries `{ type: u8, length: u8, .. }`.

use crate::sdt::Table;
use crate::{AcpiError, read_u32};

const ENTRIES_OFFSET: usize = 8;

pub mod entry_type {
    pub const LOCAL_APIC: u8 = 0;
    pub const IO_APIC: u8 = 1;
    pub const LOCAL_X2APIC: u8 = 9;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LocalApic {
    pub processor_id: u8,
    pub apic_id: u8,
    pub flags: u32,
}

impl LocalApic {
    /// Bit 0: the processor is usable.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.flags & 1 != 0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IoApic {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LocalX2Apic {
    pub x2apic_id: u32,
    pub flags: u32,
    pub acpi_id: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MadtEntry {
    LocalApic(LocalApic),
    IoApic(IoApic),
    LocalX2Apic(LocalX2Apic),
    Other { kind: u8, length: u8 },
}

/// A processor announced by the firmware.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Processor {
    pub apic_id: u32,
    pub acpi_id: u32,
    pub x2apic: bool,
}

#[derive(Debug, Copy, Clone)]
pub struct Madt<'a> {
    table: Table<'a>,
    local_apic_address: u32,
    flags: u32,
}

impl<'a> Madt<'a> {
    pub const SIGNATURE: &'static [u8; 4] = b"APIC";

    /// # Errors
    /// [`AcpiError::BadSignature`] for a different table,
    /// [`AcpiError::Truncated`] if the fixed fields are missing.
    pub fn parse(table: Table<'a>) -> Result<Self, AcpiError> {
        if &table.header().signature != Self::SIGNATURE {
            return Err(AcpiError::BadSignature);
        }
        let body = table.body();
        let truncated = AcpiError::Truncated {
            what: "MADT",
            len: body.len(),
        };
        Ok(Self {
            table,
            local_apic_address: read_u32(body, 0).ok_or(truncated)?,
            flags: read_u32(body, 4).ok_or(truncated)?,
        })
    }

    #[must_use]
    pub const fn local_apic_address(&self) -> u32 {
        self.local_apic_address
    }

    /// Bit 0: legacy 8259 PICs are present.
    #[must_use]
    pub const fn flags(&self) -> u32 {
        self.flags
    }

    pub fn entries(&self) -> MadtEntries<'a> {
        MadtEntries {
            bytes: self.table.body(),
            offset: ENTRIES_OFFSET,
        }
    }

    /// Enabled local APICs and all local x2APICs, in table order.
    pub fn processors(&self) -> impl Iterator<Item = Processor> + use<'a> {
        self.entries().filter_map(|entry| match entry {
            MadtEntry::LocalApic(lapic) if lapic.enabled() => Some(Processor {
                apic_id: u32::from(lapic.apic_id),
                acpi_id: u32::from(lapic.processor_id),
                x2apic: false,
            }),
            MadtEntry::LocalX2Apic(x2) => Some(Processor {
                apic_id: x2.x2apic_id,
                acpi_id: x2.acpi_id,
                x2apic: true,
            }),
            _ => None,
        })
    }

    pub fn io_apics(&self) -> impl Iterator<Item = IoApic> + use<'a> {
        self.entries().filter_map(|entry| match entry {
            MadtEntry::IoApic(io) => Some(io),
            _ => None,
        })
    }
}

/// Walks the entry list. Stops at the end of the table, at a zero-length
/// entry, or at an entry that would run past the end.
pub struct MadtEntries<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Iterator for MadtEntries<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let head = self.bytes.get(self.offset..self.offset + 2)?;
        let (kind, length) = (head[0], head[1]);
        let end = self.offset + length as usize;
        if length < 2 || end > self.bytes.len() {
            self.offset = self.bytes.len();
            return None;
        }
        let e = &self.bytes[self.offset..end];
        self.offset = end;

        let entry = match kind {
            entry_type::LOCAL_APIC if e.len() >= 8 => MadtEntry::LocalApic(LocalApic {
                processor_id: e[2],
                apic_id: e[3],
                flags: read_u32(e, 4)?,
            }),
            entry_type::IO_APIC if e.len() >= 12 => MadtEntry::IoApic(IoApic {
                id: e[2],
                address: read_u32(e, 4)?,
                gsi_base: read_u32(e, 8)?,
            }),
            entry_type::LOCAL_X2APIC if e.len() >= 16 => {
                MadtEntry::LocalX2Apic(LocalX2Apic {
                    x2apic_id: read_u32(e, 4)?,
                    flags: read_u32(e, 8)?,
                    acpi_id: read_u32(e, 12)?,
                })
            }
            _ => MadtEntry::Other { kind, length },
        };
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::table;

    fn madt(entries: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0xfee0_0000u32.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        for e in entries {
            body.extend_from_slice(e);
        }
        table(b"APIC", &body)
    }

    const CPU0: &[u8] = &[0, 8, 0, 0, 1, 0, 0, 0];
    const CPU1_DISABLED: &[u8] = &[0, 8, 1, 1, 0, 0, 0, 0];
    const IOAPIC: &[u8] = &[1, 12, 2, 0, 0x00, 0x00, 0xc0, 0xfe, 0, 0, 0, 0];
    const X2APIC: &[u8] = &[9, 16, 0, 0, 0x00, 0x01, 0, 0, 1, 0, 0, 0, 7, 0, 0, 0];
    const ISO: &[u8] = &[2, 10, 0, 0, 2, 0, 0, 0, 0, 0];

    #[test]
    fn entries_are_decoded() {
        let bytes = madt(&[CPU0, CPU1_DISABLED, IOAPIC, ISO, X2APIC]);
        let madt = Madt::parse(Table::from_bytes(0, &bytes).unwrap()).unwrap();
        assert_eq!(madt.local_apic_address(), 0xfee0_0000);
        assert_eq!(madt.flags(), 1);

        let entries: Vec<_> = madt.entries().collect();
        assert_eq!(entries.len(), 5);
        assert_eq!(
            entries[2],
            MadtEntry::IoApic(IoApic {
                id: 2,
                address: 0xfec0_0000,
                gsi_base: 0
            })
        );
        assert_eq!(entries[3], MadtEntry::Other { kind: 2, length: 10 });
        assert_eq!(madt.io_apics().count(), 1);
    }

    #[test]
    fn disabled_local_apics_are_skipped() {
        let bytes = madt(&[CPU0, CPU1_DISABLED, X2APIC]);
        let madt = Madt::parse(Table::from_bytes(0, &bytes).unwrap()).unwrap();
        let cpus: Vec<_> = madt.processors().collect();
        assert_eq!(
            cpus,
            vec![
                Processor {
                    apic_id: 0,
                    acpi_id: 0,
                    x2apic: false
                },
                Processor {
                    apic_id: 0x100,
                    acpi_id: 7,
                    x2apic: true
                },
            ]
        );
    }

    #[test]
    fn zero_length_entry_ends_the_walk() {
        let bytes = madt(&[CPU0, &[0, 0, 0, 0, 0, 0, 0, 0], CPU0]);
        let madt = Madt::parse(Table::from_bytes(0, &bytes).unwrap()).unwrap();
        assert_eq!(madt.entries().count(), 1);
    }

    #[test]
    fn overlong_entry_ends_the_walk() {
        let bytes = madt(&[CPU0, &[1, 40, 0, 0]]);
        let madt = Madt::parse(Table::from_bytes(0, &bytes).unwrap()).unwrap();
        assert_eq!(madt.entries().count(), 1);
    }

    #[test]
    fn other_tables_are_rejected() {
        let bytes = table(b"HPET", &[0; 20]);
        assert_eq!(
            Madt::parse(Table::from_bytes(0, &bytes).unwrap()).unwrap_err(),
            AcpiError::BadSignature
        );
    }
}
