//! # Typed `X86_64` Registers
//!
//! Bitfield views of the control registers and MSRs the boot path touches,
//! plus a `CPUID` abstraction that can be replaced by a table in tests.
//!
//! The instruction wrappers are only compiled with the `asm` feature, so the
//! bitfield types stay usable from host-side unit tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cpuid")]
pub mod cpuid;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "efer")]
pub mod efer;

#[cfg(feature = "msr")]
pub mod msr;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Writing a control register changes global CPU state such as the active
    /// address space.
    unsafe fn store_unsafe(self);
}
