//! # Kernel Layout and Boot Interface
//!
//! This crate is the single source of truth for the kernel's memory layout
//! constants and for the data the bootloader hands over at entry. It contains
//! no `unsafe` code: the kernel turns the raw handoff pointer into a byte
//! slice once, and everything here works on that slice.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Direct map**: all physical memory is mapped at [`DMAP_BASE`](memory::DMAP_BASE) + `pa`.
//! * **Kernel link window**: the kernel image executes at
//!   [`KLINK_OFFSET`](memory::KLINK_OFFSET) + `pa`.
//! * **Early window**: the boot stub maps the first GiB only; the page
//!   allocator hands out nothing above [`EARLY_MAP_END`](memory::EARLY_MAP_END)
//!   until the permanent kernel map is active.
//!
//! ### Boot Information ([`boot`])
//! A safe reader for the multiboot2 information structure: command line,
//! memory map, boot device and the ACPI root pointer copies.
//!
//! ### Command Line ([`cmdline`])
//! `key=value` and flag lookup over the kernel command line.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Identity map (boot only)      │ 0 .. 1 GiB, torn down
//!                       ├─────────────────────────────────┤
//!                       │         (unmapped)              │
//! DMAP_BASE             ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │   Direct map of physical RAM    │
//! DMAP_END              ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │         (unmapped)              │
//! KLINK_OFFSET          ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel image (text, data)     │ KERNLINK = +1 MiB
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │ always reserved
//! KERNLINK_PA ├─────────────────────────────────┤ 0x0010_0000
//!             │       Kernel Image              │ reserved at boot
//!             ├─────────────────────────────────┤
//!             │    Available RAM                │ region tracker / buddy
//!             └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod cmdline;
pub mod memory;
