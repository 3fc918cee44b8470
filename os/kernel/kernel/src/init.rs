//! # Boot Sequence
//!
//! ```text
//! console ─► boot info ─► CPU ─► memory core ─► switch ─► ACPI ─► HPET ─► APIC ─► timer
//! ```
//!
//! Runs once on the bootstrap processor with interrupts off. Any failure here
//! is fatal and ends in the panic handler.

use crate::boot::{BootContext, MemoryCore};
use crate::entry::halt;
use crate::image::{boot_root, kernel_image};
use crate::iomap::FirmwareWindow;
use kernel_acpi::Acpi;
use kernel_acpi::hpet::HpetTable;
use kernel_acpi::rsdp::Rsdp;
use kernel_alloc::kernel_map::KernelMap;
use kernel_alloc::phys_mapper::DirectMap;
use kernel_console::{COM1, ConsoleLogger, DebugCon, NativePorts, SerialPort, set_level};
use kernel_devices::apic::{self, ApicMode, LocalApic, NativeMsr, X2Apic, XApic, XAPIC_MMIO_SIZE};
use kernel_devices::cpu;
use kernel_devices::hpet::{HPET_MMIO_SIZE, Hpet};
use kernel_devices::mmio::Mmio;
use kernel_devices::timer::TimerRegistry;
use kernel_info::boot::{BootInfo, check_magic, total_size};
use kernel_info::memory::{EARLY_MAP_END, p2v};
use kernel_memory_addresses::PhysicalAddress;
use kernel_registers::cpuid::NativeCpuid;
use kernel_vmem::{AddressSpace, FrameAlloc, PagingFeatures, PhysMapper};
use log::{LevelFilter, info};

#[cfg(feature = "qemu")]
const DEBUGCON: Option<DebugCon<NativePorts>> = Some(unsafe { DebugCon::new(NativePorts) });
#[cfg(not(feature = "qemu"))]
const DEBUGCON: Option<DebugCon<NativePorts>> = None;

static LOGGER: ConsoleLogger<NativePorts> = ConsoleLogger::new(
    // SAFETY: the kernel is the only user of COM1 and the debug port.
    unsafe { SerialPort::new(NativePorts, COM1, 115_200) },
    DEBUGCON,
    LevelFilter::Trace,
);

/// Borrows the boot information through the boot stub's direct map.
///
/// # Safety
/// `info_pa` must be the address handed over by the loader, below
/// `EARLY_MAP_END` and never reused while the returned slice lives.
unsafe fn boot_info<'a>(info_pa: u64) -> &'a [u8] {
    let base = p2v(PhysicalAddress::new(info_pa));
    // SAFETY: the fixed header is always present; the loader reports the size.
    unsafe {
        let len = total_size(&*base.as_ptr::<[u8; 8]>());
        core::slice::from_raw_parts(base.as_ptr::<u8>(), len)
    }
}

/// Maps a device register window uncached.
#[allow(clippy::cast_possible_truncation)]
fn map_device<M: PhysMapper>(
    kmap: &KernelMap<'_, M>,
    frames: &mut impl FrameAlloc,
    base: PhysicalAddress,
    len: u64,
    what: &str,
) -> Mmio {
    let va = kmap
        .ioremap(base, len, frames)
        .unwrap_or_else(|e| panic!("{what}: {e}"));
    // SAFETY: just mapped; the kernel map is never torn down.
    unsafe { Mmio::new(va, len as usize) }
}

pub fn kernel_main(info_pa: u64, magic: u32) -> ! {
    LOGGER.init(LevelFilter::Info).unwrap_or_else(|e| panic!("{e}"));
    info!("kernel: booting");

    check_magic(magic).unwrap_or_else(|e| panic!("{e}"));
    // SAFETY: the loader's pointer, checked by magic above.
    let info = BootInfo::parse(unsafe { boot_info(info_pa) }).unwrap_or_else(|e| panic!("{e}"));

    let mut ctx = BootContext::new();
    if let Some(level) = ctx.load_boot_info(&info) {
        set_level(level);
    }

    let cpu = cpu::identify(&NativeCpuid).unwrap_or_else(|e| panic!("{e}"));
    // SAFETY: reading EFER has no side effects.
    let features = unsafe { PagingFeatures::detect() };
    info!("paging: nx {} (cpu reports {})", features.nx, cpu.nx);

    let image = kernel_image();
    ctx.reserve_boot_regions(&image, info.footprint(PhysicalAddress::new(info_pa)));

    let MemoryCore { mut buddy, mut kmap } = ctx.bring_up_memory(&DirectMap, &image, features, EARLY_MAP_END);
    // SAFETY: code, stack and statics run at link addresses, everything
    // else is reached through the direct map.
    unsafe { kmap.activate() }.unwrap_or_else(|e| panic!("{e}"));
    let boot = AddressSpace::from_root(&DirectMap, boot_root(), features);
    if let Err(e) = kmap.kill_identity_map(&boot) {
        panic!("{e}");
    }

    let (xsdp, rsdp) = info.acpi_pointers();
    let rsdp = Rsdp::select(xsdp, rsdp).unwrap_or_else(|e| panic!("{e}"));
    let hpet_table: Option<HpetTable> = {
        let window = FirmwareWindow::new(&kmap, &mut buddy);
        let acpi = Acpi::new(&window, &rsdp);
        acpi.dump();
        if let Some(madt) = acpi.madt() {
            for p in madt.processors() {
                info!("acpi: processor {} apic id {}", p.acpi_id, p.apic_id);
            }
        }
        acpi.hpet()
    };

    let mut hpet = hpet_table.and_then(|table| {
        let base = PhysicalAddress::new(table.mmio_base()?);
        Hpet::reserve_mmio(&mut ctx.tracker, base);
        let regs = map_device(&kmap, &mut buddy, base, HPET_MMIO_SIZE, "hpet");
        Some(Hpet::new(table.number, base, regs))
    });
    let mut timers = TimerRegistry::new();
    if let Some(hpet) = hpet.as_mut() {
        timers.register(hpet).unwrap_or_else(|e| panic!("{e}"));
    }

    buddy.release_deferred(&ctx.tracker);
    buddy.dump();

    let mode = apic::detect(&NativeCpuid).unwrap_or_else(|e| panic!("{e}"));
    // SAFETY: this is the bootstrap processor and `detect` found the mode.
    let base = unsafe { apic::enable(&NativeMsr, mode) };
    let lapic: LocalApic<Mmio, NativeMsr> = match mode {
        ApicMode::XApic => LocalApic::XApic(XApic::new(map_device(
            &kmap,
            &mut buddy,
            base.base(),
            XAPIC_MMIO_SIZE,
            "apic",
        ))),
        // SAFETY: enabled in x2APIC mode above.
        ApicMode::X2Apic => LocalApic::X2Apic(unsafe { X2Apic::new(NativeMsr) }),
    };
    lapic.init_bsp();

    match timers.select() {
        Ok(timer) => info!("timer: {}", timer.name()),
        Err(e) => panic!("{e}"),
    }
    timers.delay_us(1_000).unwrap_or_else(|e| panic!("{e}"));

    info!(
        "kernel: memory up, {} pages free, cpu {} apic {}",
        buddy.free_page_count(),
        cpu.vendor.name(),
        lapic.id()
    );
    halt()
}
