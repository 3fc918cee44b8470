use bitfield_struct::bitfield;

/// Architecture-neutral permissions for a mapping.
///
/// The address space translates these into [`PageTableEntry`](crate::PageTableEntry)
/// bits; `executable = false` only becomes `NX` on CPUs that support it.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct MapFlags {
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
    /// Uncached device memory (`PCD | PWT`).
    pub device: bool,
    #[bits(4)]
    __: u8,
}

impl MapFlags {
    /// Kernel data: read/write, not executable.
    pub const KERNEL_RW: Self = Self::new().with_writable(true);
    /// Kernel read-only data.
    pub const KERNEL_RO: Self = Self::new();
    /// Kernel code: read-only, executable.
    pub const KERNEL_RX: Self = Self::new().with_executable(true);
    /// Device registers: read/write, uncached, not executable.
    pub const DEVICE: Self = Self::new().with_writable(true).with_device(true);
}
