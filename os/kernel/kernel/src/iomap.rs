//! Read-only firmware table access through [`KernelMap::ioremap`].

use core::cell::RefCell;
use kernel_acpi::PhysMapRo;
use kernel_alloc::kernel_map::KernelMap;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::warn;

/// Maps each requested window on demand, taking page tables from `frames`.
pub struct FirmwareWindow<'k, 'm, M: PhysMapper, A: FrameAlloc> {
    kmap: &'k KernelMap<'m, M>,
    frames: RefCell<&'k mut A>,
}

impl<'k, 'm, M: PhysMapper, A: FrameAlloc> FirmwareWindow<'k, 'm, M, A> {
    pub const fn new(kmap: &'k KernelMap<'m, M>, frames: &'k mut A) -> Self {
        Self {
            kmap,
            frames: RefCell::new(frames),
        }
    }
}

impl<M: PhysMapper, A: FrameAlloc> PhysMapRo for FirmwareWindow<'_, '_, M, A> {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> Option<&'a [u8]> {
        let mut frames = self.frames.try_borrow_mut().ok()?;
        let va = self
            .kmap
            .ioremap(PhysicalAddress::new(paddr), u64::try_from(len).ok()?, &mut **frames)
            .inspect_err(|e| warn!("cannot map {len:#x} bytes at {paddr:#x}: {e}"))
            .ok()?;
        // SAFETY: the window was just mapped and stays mapped; the caller
        // guarantees it holds firmware tables nobody writes to.
        Some(unsafe { core::slice::from_raw_parts(va.as_ptr::<u8>(), len) })
    }
}
