//! # Memory Layout

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Base of the direct map. Physical address `pa` is visible at `DMAP_BASE + pa`.
pub const DMAP_BASE: u64 = 0xffff_8000_0000_0000;

/// Exclusive end of the direct map (64 TiB of physical address space).
pub const DMAP_END: u64 = 0xffff_c000_0000_0000;

/// Offset between the kernel's link addresses and its load addresses.
pub const KLINK_OFFSET: u64 = 0xffff_ffff_8000_0000;

/// Physical address the kernel image is loaded to.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNLINK_PA: u64 = 0x0010_0000; // 1 MiB

/// Virtual address the kernel image is linked at.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNLINK: u64 = KLINK_OFFSET + KERNLINK_PA;

/// Physical memory below this address (BIOS data, VGA, option ROMs) is never
/// handed to an allocator.
pub const LOW_MEMORY_END: u64 = 0x0010_0000;

/// The boot stub identity- and direct-maps physical memory up to here.
pub const EARLY_MAP_END: u64 = 1 << 30; // 1 GiB

/// The size of the boot stack.
pub const BOOT_STACK_SIZE: usize = 32 * 1024;

const _: () = {
    assert!(BOOT_STACK_SIZE.is_multiple_of(4096));
    assert!(DMAP_END > DMAP_BASE);
    assert!(KLINK_OFFSET > DMAP_END);
    assert!(KERNLINK.is_multiple_of(4096));
    assert!(EARLY_MAP_END.is_multiple_of(1 << 21));
    assert!(KERNLINK_PA >= LOW_MEMORY_END);
};

/// Returns `true` if `va` lies inside the direct map.
#[inline]
#[must_use]
pub const fn is_dmap(va: VirtualAddress) -> bool {
    va.as_u64() >= DMAP_BASE && va.as_u64() < DMAP_END
}

/// Direct-map virtual address of `pa`.
#[inline]
#[must_use]
pub const fn p2v(pa: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(pa.as_u64() + DMAP_BASE)
}

/// Physical address behind a direct-map or kernel-image virtual address.
///
/// Addresses outside the direct map are assumed to be kernel link addresses.
#[inline]
#[must_use]
pub const fn v2p(va: VirtualAddress) -> PhysicalAddress {
    if is_dmap(va) {
        PhysicalAddress::new(va.as_u64() - DMAP_BASE)
    } else {
        PhysicalAddress::new(va.as_u64().wrapping_sub(KLINK_OFFSET))
    }
}

/// Kernel link-window virtual address of an image byte at `pa`.
#[inline]
#[must_use]
pub const fn kernel_link(pa: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(pa.as_u64() + KLINK_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_round_trip() {
        let pa = PhysicalAddress::new(0x20_1000);
        let va = p2v(pa);
        assert_eq!(va.as_u64(), 0xffff_8000_0020_1000);
        assert!(is_dmap(va));
        assert_eq!(v2p(va), pa);
    }

    #[test]
    fn kernel_link_addresses_translate_back() {
        let va = VirtualAddress::new(KERNLINK + 0x1234);
        assert!(!is_dmap(va));
        assert_eq!(v2p(va).as_u64(), KERNLINK_PA + 0x1234);
        assert_eq!(kernel_link(PhysicalAddress::new(KERNLINK_PA)).as_u64(), KERNLINK);
    }

    #[test]
    fn dmap_end_is_exclusive() {
        assert!(!is_dmap(VirtualAddress::new(DMAP_END)));
        assert!(is_dmap(VirtualAddress::new(DMAP_END - 1)));
    }
}
