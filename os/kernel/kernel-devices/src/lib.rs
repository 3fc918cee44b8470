//! # Early Platform Devices
//!
//! The handful of devices the boot path needs once memory management is up:
//!
//! * [`cpu`]: vendor identification by `CPUID` and per-vendor init.
//! * [`timer`]: a registry of [`ClockSource`](timer::ClockSource)s that
//!   probes candidates in registration order and keeps the first that works.
//! * [`hpet`]: the High Precision Event Timer as a clock source.
//! * [`apic`]: the bootstrap processor's local APIC in xAPIC or x2APIC mode.
//!
//! Hardware access sits behind small traits ([`RegisterBlock`](mmio::RegisterBlock),
//! [`MsrIo`](apic::MsrIo), [`Cpuid`](kernel_registers::cpuid::Cpuid)) so the
//! drivers run against fakes on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod apic;
pub mod cpu;
pub mod hpet;
pub mod mmio;
pub mod timer;

/// Why a device was rejected during probing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProbeError {
    #[error("clock period of {0} fs is out of range")]
    BadPeriod(u32),
    #[error("counter does not advance")]
    CounterStuck,
    #[error("No apic")]
    NoApic,
}
