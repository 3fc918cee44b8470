//! # Multiboot2 Entry
//!
//! The loader jumps to `_mb_start` in 32-bit protected mode with paging off,
//! `eax` holding the boot magic and `ebx` the physical address of the boot
//! information. The stub:
//!
//! 1. fills the boot page tables with 2 MiB pages covering the first
//!    gigabyte three times: identity, direct map and kernel link window,
//! 2. enables PAE, long mode, and `EFER.NXE` when `CPUID` reports NX,
//! 3. loads a flat boot GDT and far-jumps into 64-bit code,
//! 4. switches to the boot stack at its link address and calls
//!    [`kernel_entry`] with `(info_pa, magic)`.
//!
//! ```text
//! boot_pml4[0]   ─┐
//! boot_pml4[256] ─┴─► boot_pdpt_low[0]    ─┐
//! boot_pml4[511] ───► boot_pdpt_high[510] ─┴─► boot_pd: 512 × 2 MiB
//! ```

use kernel_info::memory::BOOT_STACK_SIZE;

core::arch::global_asm!(
    r#"
    .section .boot.header, "a"
    .balign 8
mb2_header_start:
    .long 0xe85250d6
    .long 0
    .long mb2_header_end - mb2_header_start
    .long 0x100000000 - (0xe85250d6 + (mb2_header_end - mb2_header_start))
    .short 0
    .short 0
    .long 8
mb2_header_end:

    .section .boot.text, "ax"
    .code32
    .globl _mb_start
_mb_start:
    cli
    movl %eax, %esi
    movl %ebx, %edi

    movl $boot_pdpt_low + 0x3, %eax
    movl %eax, boot_pml4
    movl %eax, boot_pml4 + 256 * 8
    movl $boot_pdpt_high + 0x3, %eax
    movl %eax, boot_pml4 + 511 * 8
    movl $boot_pd + 0x3, %eax
    movl %eax, boot_pdpt_low
    movl %eax, boot_pdpt_high + 510 * 8

    xorl %ecx, %ecx
2:
    movl %ecx, %eax
    shll $21, %eax
    orl $0x83, %eax
    movl %eax, boot_pd(, %ecx, 8)
    movl $0, boot_pd + 4(, %ecx, 8)
    incl %ecx
    cmpl $512, %ecx
    jne 2b

    movl %cr4, %eax
    orl $(1 << 5), %eax
    movl %eax, %cr4

    movl $boot_pml4, %eax
    movl %eax, %cr3

    xorl %ebp, %ebp
    movl $0x80000000, %eax
    cpuid
    cmpl $0x80000001, %eax
    jb 3f
    movl $0x80000001, %eax
    cpuid
    testl $(1 << 20), %edx
    jz 3f
    movl $(1 << 11), %ebp
3:
    movl $0xc0000080, %ecx
    rdmsr
    orl $(1 << 8), %eax
    orl %ebp, %eax
    wrmsr

    movl %cr0, %eax
    orl $((1 << 31) | (1 << 16) | 1), %eax
    movl %eax, %cr0

    lgdt boot_gdt_ptr
    ljmp $0x08, $boot_long_mode

    .code64
boot_long_mode:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    xorw %ax, %ax
    movw %ax, %fs
    movw %ax, %gs

    movabsq $boot_stack_top, %rsp
    xorl %ebp, %ebp
    movl %edi, %edi
    movl %esi, %esi
    movabsq ${entry}, %rax
    callq *%rax
4:
    hlt
    jmp 4b

    .section .boot.rodata, "a"
    .balign 8
boot_gdt:
    .quad 0
    .quad 0x00af9a000000ffff
    .quad 0x00cf92000000ffff
boot_gdt_end:
boot_gdt_ptr:
    .short boot_gdt_end - boot_gdt - 1
    .long boot_gdt

    .section .boot.data, "aw", @progbits
    .balign 4096
    .globl boot_pml4
boot_pml4:
    .skip 4096
boot_pdpt_low:
    .skip 4096
boot_pdpt_high:
    .skip 4096
boot_pd:
    .skip 4096

    .section .bss.boot_stack, "aw", @nobits
    .balign 16
boot_stack:
    .skip {stack_size}
boot_stack_top:

    .text
"#,
    entry = sym kernel_entry,
    stack_size = const BOOT_STACK_SIZE,
    options(att_syntax),
);

/// First Rust code, on the boot stack at the kernel's link address.
#[unsafe(no_mangle)]
extern "C" fn kernel_entry(info_pa: u64, magic: u32) -> ! {
    #[cfg(feature = "qemu")]
    kernel_console::qemu_trace!("kernel entry: info {info_pa:#x}, magic {magic:#x}\n");

    crate::init::kernel_main(info_pa, magic)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("panic: {info}");
    halt()
}

/// Stops this CPU for good.
pub fn halt() -> ! {
    loop {
        // SAFETY: interrupts stay off during boot, so this never resumes.
        unsafe { core::arch::asm!("cli; hlt", options(nomem, nostack)) };
    }
}
