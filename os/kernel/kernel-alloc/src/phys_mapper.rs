//! # Direct-Map PhysMapper
//!
//! Every physical address `pa` is visible at `DMAP_BASE + pa`, both under the
//! boot stub's tables (first gigabyte) and under the kernel address space
//! (all tracked memory).
//!
//! ```rust
//! use kernel_alloc::phys_mapper::DirectMap;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let va = DirectMap.phys_to_virt(PhysicalAddress::new(0x1000));
//! assert_eq!(va.as_u64(), 0xffff_8000_0000_1000);
//! ```

use kernel_info::memory::p2v;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the kernel's direct map.
///
/// # Safety
/// Dereferencing the returned addresses requires the direct map to cover
/// the physical range.
#[derive(Debug, Copy, Clone, Default)]
pub struct DirectMap;

impl PhysMapper for DirectMap {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        p2v(pa)
    }
}
