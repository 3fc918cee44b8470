//! # Kernel Boot Information
//!
//! Reader for the multiboot2 boot information structure. The bootloader
//! passes its physical address in `ebx` (and [`BOOTLOADER_MAGIC`] in `eax`);
//! the kernel turns it into a byte slice and hands that to [`BootInfo::parse`].
//!
//! ```text
//! +0   u32 total_size
//! +4   u32 reserved
//! +8   tag { u32 type, u32 size, payload.. }   padded to 8 bytes
//!      tag ...
//!      tag { type = 0, size = 8 }              end
//! ```
//!
//! [`BootInfo::parse`] checks the framing of every tag once, so iterating
//! afterwards cannot fail.

use crate::cmdline::CommandLine;
use kernel_memory_addresses::PhysicalAddress;

/// Value of `eax` when a multiboot2 loader enters the kernel.
pub const BOOTLOADER_MAGIC: u32 = 0x36d7_6289;

/// Magic value at the start of the multiboot2 header in the kernel image.
pub const HEADER_MAGIC: u32 = 0xe852_50d6;

/// Tag type numbers.
pub mod tag_type {
    pub const END: u32 = 0;
    pub const CMDLINE: u32 = 1;
    pub const BOOT_LOADER_NAME: u32 = 2;
    pub const MODULE: u32 = 3;
    pub const BASIC_MEMINFO: u32 = 4;
    pub const BOOTDEV: u32 = 5;
    pub const MMAP: u32 = 6;
    pub const ACPI_OLD: u32 = 14;
    pub const ACPI_NEW: u32 = 15;
}

const FIXED_HEADER: usize = 8;
const TAG_HEADER: usize = 8;
const MMAP_HEADER: usize = 8;
const MMAP_ENTRY_MIN: u32 = 24;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootInfoError {
    #[error("unexpected bootloader magic {0:#010x}")]
    BadMagic(u32),
    #[error("boot information is truncated ({available} of {required} bytes)")]
    Truncated { required: usize, available: usize },
    #[error("tag at offset {offset:#x} has invalid size {size}")]
    BadTagSize { offset: usize, size: u32 },
    #[error("boot information has no end tag")]
    MissingEndTag,
    #[error("memory map entry size {0} is too small")]
    BadMmapEntrySize(u32),
    #[error("string in tag {0} is not valid UTF-8")]
    InvalidString(u32),
}

/// Checks the value the bootloader left in `eax`.
///
/// # Errors
/// [`BootInfoError::BadMagic`] if the kernel was not started by a multiboot2
/// loader.
pub const fn check_magic(magic: u32) -> Result<(), BootInfoError> {
    if magic == BOOTLOADER_MAGIC {
        Ok(())
    } else {
        Err(BootInfoError::BadMagic(magic))
    }
}

/// Reads the `total_size` field of a boot information header.
///
/// The kernel uses this to size the slice it passes to [`BootInfo::parse`].
#[must_use]
pub fn total_size(header: &[u8; 8]) -> usize {
    u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize
}

/// Validated multiboot2 boot information.
#[derive(Copy, Clone)]
pub struct BootInfo<'a> {
    bytes: &'a [u8],
}

impl<'a> BootInfo<'a> {
    /// Validates the tag framing of `bytes`.
    ///
    /// `bytes` may be longer than `total_size`; the excess is ignored.
    ///
    /// # Errors
    /// A [`BootInfoError`] describing the first framing problem found.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, BootInfoError> {
        let total = read_u32(bytes, 0).ok_or(BootInfoError::Truncated {
            required: FIXED_HEADER,
            available: bytes.len(),
        })? as usize;
        if total < FIXED_HEADER + TAG_HEADER || total > bytes.len() {
            return Err(BootInfoError::Truncated {
                required: total.max(FIXED_HEADER + TAG_HEADER),
                available: bytes.len(),
            });
        }

        let bytes = &bytes[..total];
        let mut offset = FIXED_HEADER;
        loop {
            let (typ, size) = tag_header(bytes, offset).ok_or(BootInfoError::MissingEndTag)?;
            if (size as usize) < TAG_HEADER || offset + size as usize > total {
                return Err(BootInfoError::BadTagSize { offset, size });
            }
            let payload = &bytes[offset + TAG_HEADER..offset + size as usize];
            match typ {
                tag_type::END => break,
                tag_type::CMDLINE | tag_type::BOOT_LOADER_NAME => {
                    if c_str(payload).is_none() {
                        return Err(BootInfoError::InvalidString(typ));
                    }
                }
                tag_type::MMAP => {
                    let entry_size = read_u32(payload, 0).unwrap_or(0);
                    if entry_size < MMAP_ENTRY_MIN {
                        return Err(BootInfoError::BadMmapEntrySize(entry_size));
                    }
                }
                _ => {}
            }
            offset = align8(offset + size as usize);
        }

        Ok(Self { bytes })
    }

    /// Size of the structure in bytes, as reported by the loader.
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[must_use]
    pub const fn tags(&self) -> TagIter<'a> {
        TagIter {
            bytes: self.bytes,
            offset: FIXED_HEADER,
        }
    }

    #[must_use]
    pub fn command_line(&self) -> Option<CommandLine<'a>> {
        self.tags().find_map(|tag| match tag {
            Tag::CommandLine(line) => Some(CommandLine::new(line)),
            _ => None,
        })
    }

    #[must_use]
    pub fn boot_loader_name(&self) -> Option<&'a str> {
        self.tags().find_map(|tag| match tag {
            Tag::BootLoaderName(name) => Some(name),
            _ => None,
        })
    }

    #[must_use]
    pub fn boot_device(&self) -> Option<BootDevice> {
        self.tags().find_map(|tag| match tag {
            Tag::BootDevice(dev) => Some(dev),
            _ => None,
        })
    }

    #[must_use]
    pub fn memory_map(&self) -> Option<MemoryMap<'a>> {
        self.tags().find_map(|tag| match tag {
            Tag::MemoryMap(map) => Some(map),
            _ => None,
        })
    }

    /// The loader's ACPI root pointer copies as `(xsdp, rsdp)`, first of
    /// each kind.
    #[must_use]
    pub fn acpi_pointers(&self) -> (Option<&'a [u8]>, Option<&'a [u8]>) {
        let mut xsdp = None;
        let mut rsdp = None;
        for tag in self.tags() {
            match tag {
                Tag::AcpiNew(bytes) => xsdp = xsdp.or(Some(bytes)),
                Tag::AcpiOld(bytes) => rsdp = rsdp.or(Some(bytes)),
                _ => {}
            }
        }
        (xsdp, rsdp)
    }

    /// Physical range occupied by this structure, given where it was loaded.
    #[must_use]
    pub const fn footprint(&self, base: PhysicalAddress) -> (PhysicalAddress, u64) {
        (base, self.bytes.len() as u64)
    }
}

impl core::fmt::Debug for BootInfo<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.tags()).finish()
    }
}

/// A decoded boot information tag.
#[derive(Debug, Copy, Clone)]
pub enum Tag<'a> {
    CommandLine(&'a str),
    BootLoaderName(&'a str),
    BasicMemInfo { lower_kib: u32, upper_kib: u32 },
    BootDevice(BootDevice),
    MemoryMap(MemoryMap<'a>),
    /// Copy of the ACPI 1.0 RSDP.
    AcpiOld(&'a [u8]),
    /// Copy of the ACPI 2.0+ XSDP.
    AcpiNew(&'a [u8]),
    Other { typ: u32, payload: &'a [u8] },
}

/// BIOS boot device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootDevice {
    pub biosdev: u32,
    pub slice: u32,
    pub part: u32,
}

pub struct TagIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TagIter<'a> {
    type Item = Tag<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (typ, size) = tag_header(self.bytes, self.offset)?;
        if typ == tag_type::END {
            return None;
        }
        let end = self.offset + size as usize;
        let payload = self.bytes.get(self.offset + TAG_HEADER..end)?;
        self.offset = align8(end);

        Some(match typ {
            tag_type::CMDLINE => Tag::CommandLine(c_str(payload).unwrap_or_default()),
            tag_type::BOOT_LOADER_NAME => Tag::BootLoaderName(c_str(payload).unwrap_or_default()),
            tag_type::BASIC_MEMINFO => Tag::BasicMemInfo {
                lower_kib: read_u32(payload, 0).unwrap_or(0),
                upper_kib: read_u32(payload, 4).unwrap_or(0),
            },
            tag_type::BOOTDEV => Tag::BootDevice(BootDevice {
                biosdev: read_u32(payload, 0).unwrap_or(u32::MAX),
                slice: read_u32(payload, 4).unwrap_or(u32::MAX),
                part: read_u32(payload, 8).unwrap_or(u32::MAX),
            }),
            tag_type::MMAP => Tag::MemoryMap(MemoryMap {
                entry_size: read_u32(payload, 0).unwrap_or(MMAP_ENTRY_MIN),
                entry_version: read_u32(payload, 4).unwrap_or(0),
                entries: payload.get(MMAP_HEADER..).unwrap_or_default(),
            }),
            tag_type::ACPI_OLD => Tag::AcpiOld(payload),
            tag_type::ACPI_NEW => Tag::AcpiNew(payload),
            typ => Tag::Other { typ, payload },
        })
    }
}

/// Memory map tag.
#[derive(Debug, Copy, Clone)]
pub struct MemoryMap<'a> {
    entry_size: u32,
    entry_version: u32,
    entries: &'a [u8],
}

impl<'a> MemoryMap<'a> {
    #[must_use]
    pub const fn entry_version(&self) -> u32 {
        self.entry_version
    }

    pub fn entries(&self) -> impl Iterator<Item = MemoryMapEntry> + Clone + 'a {
        self.entries
            .chunks_exact(self.entry_size as usize)
            .map(|raw| MemoryMapEntry {
                base: PhysicalAddress::new(read_u64(raw, 0).unwrap_or(0)),
                length: read_u64(raw, 8).unwrap_or(0),
                kind: MemoryKind::from(read_u32(raw, 16).unwrap_or(0)),
            })
    }
}

/// One range of the firmware memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: PhysicalAddress,
    pub length: u64,
    pub kind: MemoryKind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    Nvs,
    BadRam,
    Unknown(u32),
}

impl From<u32> for MemoryKind {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::Nvs,
            5 => Self::BadRam,
            other => Self::Unknown(other),
        }
    }
}

const fn align8(v: usize) -> usize {
    (v + 7) & !7
}

fn tag_header(bytes: &[u8], offset: usize) -> Option<(u32, u32)> {
    Some((read_u32(bytes, offset)?, read_u32(bytes, offset + 4)?))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    raw.try_into().ok().map(u32::from_le_bytes)
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset.checked_add(8)?)?;
    raw.try_into().ok().map(u64::from_le_bytes)
}

fn c_str(payload: &[u8]) -> Option<&str> {
    let len = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    core::str::from_utf8(&payload[..len]).ok()
}
