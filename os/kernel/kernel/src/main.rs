//! # Kernel
//!
//! Multiboot2 kernel image. The loader enters `entry` in 32-bit mode; the
//! boot stub switches to long mode and calls into `init`, which brings up
//! physical memory, the kernel address space and the early devices.
//!
//! Built for the host, only the target independent parts ([`boot`]) are
//! compiled so their tests run under `cargo test`.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![allow(unsafe_code)]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

mod boot;
mod iomap;

#[cfg(target_os = "none")]
mod entry;
#[cfg(target_os = "none")]
mod image;
#[cfg(target_os = "none")]
mod init;

#[cfg(not(target_os = "none"))]
fn main() {}
