//! # Boot Console
//!
//! Byte-oriented output for the kernel before anything else works: a 16550
//! UART on COM1 and, with the `qemu` feature, QEMU's debug port `0x402`.
//! [`ConsoleLogger`] routes the `log` facade to both.
//!
//! ```text
//! info!(..) ──► ConsoleLogger ──┬──► SerialPort (COM1, 115200 8N1)
//!                               └──► DebugCon   (port 0x402, qemu)
//! qemu_trace!(..) ─────────────────► DebugCon
//! ```
//!
//! All port access goes through [`PortIo`]; [`NativePorts`] issues the
//! `in`/`out` instructions, tests substitute a recorder.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_console::{ConsoleLogger, NativePorts, SerialPort, COM1};
//! use log::{LevelFilter, info};
//!
//! static LOGGER: ConsoleLogger<NativePorts> = ConsoleLogger::new(
//!     unsafe { SerialPort::new(NativePorts, COM1, 115_200) },
//!     None,
//!     LevelFilter::Trace,
//! );
//!
//! LOGGER.init(LevelFilter::Info).unwrap_or_else(|e| panic!("{e}"));
//! info!("console up");
//! ```
//!
//! Host side, `qemu-system-x86_64 -serial stdio -debugcon file:debug.log`
//! shows both streams.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod debugcon;
mod logger;
mod serial;

pub use debugcon::{DebugCon, QEMU_DEBUG_PORT};
pub use logger::{ConsoleLogger, set_level};
pub use serial::{BASE_BAUD, COM1, COM2, SerialPort};

#[doc(hidden)]
pub use debugcon::qemu_fmt;

/// Access to the x86 I/O port space.
pub trait PortIo {
    /// Writes `val` to `port`.
    ///
    /// # Safety
    /// Port writes reach hardware directly; the caller must own the device
    /// behind `port` and run at CPL 0 (or have the port in its I/O bitmap).
    unsafe fn outb(&self, port: u16, val: u8);

    /// Reads a byte from `port`.
    ///
    /// # Safety
    /// As for [`outb`](Self::outb). Reads may have device side effects.
    unsafe fn inb(&self, port: u16) -> u8;
}

impl<T: PortIo + ?Sized> PortIo for &T {
    #[inline]
    unsafe fn outb(&self, port: u16, val: u8) {
        unsafe { (**self).outb(port, val) }
    }

    #[inline]
    unsafe fn inb(&self, port: u16) -> u8 {
        unsafe { (**self).inb(port) }
    }
}

/// Issues real `out`/`in` instructions.
#[derive(Debug, Copy, Clone, Default)]
pub struct NativePorts;

impl PortIo for NativePorts {
    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(&self, port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") port,
                in("al") val,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn inb(&self, port: u16) -> u8 {
        let val: u8;
        unsafe {
            core::arch::asm!(
                "in al, dx",
                in("dx") port,
                out("al") val,
                options(nomem, nostack, preserves_flags)
            );
        }
        val
    }
}

/// Writes formatted text straight to the QEMU debug port, bypassing `log`.
///
/// Compiles to nothing without the `qemu` feature.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}

#[cfg(test)]
pub(crate) mod testing {
    use super::PortIo;
    use std::sync::Mutex;

    /// Records every port write. Reads report a busy transmitter
    /// `busy_reads` times, then an idle one.
    #[derive(Default)]
    pub struct FakePorts {
        pub writes: Mutex<Vec<(u16, u8)>>,
        pub busy_reads: Mutex<u32>,
    }

    impl FakePorts {
        pub fn bytes_to(&self, port: u16) -> Vec<u8> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == port)
                .map(|(_, b)| *b)
                .collect()
        }
    }

    impl PortIo for FakePorts {
        unsafe fn outb(&self, port: u16, val: u8) {
            self.writes.lock().unwrap().push((port, val));
        }

        unsafe fn inb(&self, _port: u16) -> u8 {
            let mut busy = self.busy_reads.lock().unwrap();
            if *busy > 0 {
                *busy -= 1;
                0
            } else {
                0x20
            }
        }
    }
}
