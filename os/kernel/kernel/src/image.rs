//! Kernel image layout as placed by `kernel.ld`.

use kernel_alloc::kernel_map::KernelImage;
use kernel_alloc::region::MemBlock;
use kernel_info::memory::{KERNLINK_PA, v2p};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

unsafe extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __kernel_end: u8;
    /// Linked at its load address.
    static boot_pml4: u8;
}

fn phys(sym: *const u8) -> u64 {
    v2p(VirtualAddress::from_ptr(sym)).as_u64()
}

fn block(start: u64, end: u64) -> MemBlock {
    MemBlock::new(PhysicalAddress::new(start), end.saturating_sub(start))
}

/// Physical extent of the loaded image and its `.text` and `.rodata`.
pub fn kernel_image() -> KernelImage {
    // SAFETY: only the addresses of the linker symbols are taken.
    let (text, text_end, rodata, rodata_end, end) = unsafe {
        (
            phys(&raw const __text_start),
            phys(&raw const __text_end),
            phys(&raw const __rodata_start),
            phys(&raw const __rodata_end),
            phys(&raw const __kernel_end),
        )
    };
    KernelImage {
        image: block(KERNLINK_PA, end),
        text: block(text, text_end),
        rodata: block(rodata, rodata_end),
    }
}

/// Root of the boot stub's page tables.
pub fn boot_root() -> PhysicalAddress {
    // SAFETY: as above.
    PhysicalAddress::new(unsafe { &raw const boot_pml4 } as u64)
}
