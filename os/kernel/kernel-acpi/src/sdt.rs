//! # System Description Tables
//!
//! Every table starts with the same 36-byte header and must sum to zero over
//! its full `length`. The root table's body is an array of physical
//! addresses: `u32` for the RSDT, `u64` for the XSDT.

use crate::{AcpiError, PhysMapRo, read_u32, read_u64, sum};
use log::warn;

pub const HEADER_LEN: usize = 36;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    /// # Errors
    /// [`AcpiError::Truncated`] for fewer than 36 bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, AcpiError> {
        let b = bytes.get(..HEADER_LEN).ok_or(AcpiError::Truncated {
            what: "SDT header",
            len: bytes.len(),
        })?;
        let mut h = Self {
            signature: [0; 4],
            length: read_u32(b, 4).unwrap_or(0),
            revision: b[8],
            checksum: b[9],
            oem_id: [0; 6],
            oem_table_id: [0; 8],
            oem_revision: read_u32(b, 24).unwrap_or(0),
            creator_id: read_u32(b, 28).unwrap_or(0),
            creator_revision: read_u32(b, 32).unwrap_or(0),
        };
        h.signature.copy_from_slice(&b[0..4]);
        h.oem_id.copy_from_slice(&b[10..16]);
        h.oem_table_id.copy_from_slice(&b[16..24]);
        Ok(h)
    }

    #[must_use]
    pub fn signature_str(&self) -> &str {
        core::str::from_utf8(&self.signature).unwrap_or("????")
    }

    #[must_use]
    pub fn oem_id_str(&self) -> &str {
        core::str::from_utf8(&self.oem_id).unwrap_or("?").trim_end()
    }

    #[must_use]
    pub fn oem_table_id_str(&self) -> &str {
        core::str::from_utf8(&self.oem_table_id).unwrap_or("?").trim_end()
    }
}

/// A checksummed table in mapped memory.
#[derive(Debug, Copy, Clone)]
pub struct Table<'a> {
    address: u64,
    header: SdtHeader,
    bytes: &'a [u8],
}

impl<'a> Table<'a> {
    /// Validates a table already in hand.
    ///
    /// # Errors
    /// [`AcpiError::Truncated`] if `bytes` is shorter than the header says,
    /// [`AcpiError::BadChecksum`] if the table does not sum to zero.
    pub fn from_bytes(address: u64, bytes: &'a [u8]) -> Result<Self, AcpiError> {
        let header = SdtHeader::parse(bytes)?;
        let len = header.length as usize;
        let bytes = bytes
            .get(..len)
            .filter(|_| len >= HEADER_LEN)
            .ok_or(AcpiError::Truncated {
                what: "SDT",
                len: bytes.len(),
            })?;
        if sum(bytes) != 0 {
            return Err(AcpiError::BadChecksum("SDT"));
        }
        Ok(Self {
            address,
            header,
            bytes,
        })
    }

    /// Maps the header, then the full table, and validates it.
    ///
    /// # Errors
    /// [`AcpiError::Unmapped`] or as [`from_bytes`](Self::from_bytes).
    ///
    /// # Safety
    /// `map` must hand out slices valid for `'a`.
    pub unsafe fn load<M: PhysMapRo + ?Sized>(map: &M, address: u64) -> Result<Self, AcpiError> {
        let head = unsafe { map.map_ro(address, HEADER_LEN) }.ok_or(AcpiError::Unmapped {
            paddr: address,
            len: HEADER_LEN,
        })?;
        let len = (SdtHeader::parse(head)?.length as usize).max(HEADER_LEN);
        let bytes = unsafe { map.map_ro(address, len) }.ok_or(AcpiError::Unmapped { paddr: address, len })?;
        Self::from_bytes(address, bytes)
    }

    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }

    #[must_use]
    pub const fn header(&self) -> &SdtHeader {
        &self.header
    }

    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Everything after the common header.
    #[must_use]
    pub fn body(&self) -> &'a [u8] {
        &self.bytes[HEADER_LEN..]
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RootKind {
    Rsdt,
    Xsdt,
}

impl RootKind {
    #[must_use]
    pub const fn entry_size(self) -> usize {
        match self {
            Self::Rsdt => 4,
            Self::Xsdt => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RootTable {
    kind: RootKind,
    address: u64,
}

impl RootTable {
    #[must_use]
    pub const fn new(kind: RootKind, address: u64) -> Self {
        Self { kind, address }
    }

    #[must_use]
    pub const fn kind(&self) -> RootKind {
        self.kind
    }

    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Physical addresses of the tables the root points at;
    /// `(length - 36) / entry_size` of them. Empty if the root table itself
    /// is unusable.
    pub fn entries<'m, M: PhysMapRo + ?Sized>(&self, map: &'m M) -> impl Iterator<Item = u64> + use<'m, M> {
        let kind = self.kind;
        // SAFETY: the address comes from a checksummed root pointer.
        let body = match unsafe { Table::load(map, self.address) } {
            Ok(table) => table.body(),
            Err(err) => {
                warn!("{kind:?} at {:#x}: {err}", self.address);
                &[]
            }
        };
        body.chunks_exact(kind.entry_size()).map(move |entry| match kind {
            RootKind::Rsdt => u64::from(read_u32(entry, 0).unwrap_or(0)),
            RootKind::Xsdt => read_u64(entry, 0).unwrap_or(0),
        })
    }
}
