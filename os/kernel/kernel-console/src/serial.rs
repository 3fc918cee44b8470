//! 16550 UART driver, polled, transmit only.

use crate::PortIo;
use core::fmt;

pub const COM1: u16 = 0x3f8;
pub const COM2: u16 = 0x2f8;

/// UART input clock divided by 16; divisor 1 yields this rate.
pub const BASE_BAUD: u32 = 115_200;

/// Register offsets from the port base.
mod reg {
    pub const DATA: u16 = 0;
    pub const IER: u16 = 1;
    /// Divisor latch low/high, visible while `LCR.DLAB` is set.
    pub const DLL: u16 = 0;
    pub const DLH: u16 = 1;
    pub const FCR: u16 = 2;
    pub const LCR: u16 = 3;
    pub const MCR: u16 = 4;
    pub const LSR: u16 = 5;
}

const LCR_DLAB: u8 = 0x80;
const LCR_8N1: u8 = 0x03;
const MCR_DTR_RTS: u8 = 0x03;
const LSR_THR_EMPTY: u8 = 0x20;

/// Polls of `LSR` before a byte is sent regardless. Keeps a missing UART
/// from hanging the boot.
const TX_SPIN_LIMIT: u32 = 100_000;

pub struct SerialPort<P: PortIo> {
    io: P,
    base: u16,
    baud: u32,
}

impl<P: PortIo> SerialPort<P> {
    /// # Safety
    /// The caller hands this driver exclusive use of the eight ports at
    /// `base`.
    #[must_use]
    pub const unsafe fn new(io: P, base: u16, baud: u32) -> Self {
        Self { io, base, baud }
    }

    #[must_use]
    pub const fn base(&self) -> u16 {
        self.base
    }

    /// Divisor latch value for the configured rate, at least 1.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn divisor(&self) -> u16 {
        let div = if self.baud == 0 { 1 } else { BASE_BAUD / self.baud };
        if div == 0 {
            1
        } else if div > 0xffff {
            u16::MAX
        } else {
            div as u16
        }
    }

    /// Interrupts off, FIFO off, programs the divisor, raises DTR/RTS and
    /// selects 8N1.
    pub fn init(&self) {
        let [lo, hi] = self.divisor().to_le_bytes();
        self.out(reg::IER, 0);
        self.out(reg::FCR, 0);
        self.out(reg::LCR, LCR_DLAB);
        self.out(reg::DLL, lo);
        self.out(reg::DLH, hi);
        self.out(reg::MCR, MCR_DTR_RTS);
        self.out(reg::LCR, LCR_8N1);
    }

    fn out(&self, offset: u16, val: u8) {
        // SAFETY: exclusive ownership of the port range is a constructor
        // precondition.
        unsafe { self.io.outb(self.base + offset, val) }
    }

    fn transmit_empty(&self) -> bool {
        // SAFETY: see `out`; reading LSR has no side effects.
        unsafe { self.io.inb(self.base + reg::LSR) & LSR_THR_EMPTY != 0 }
    }

    fn send(&self, byte: u8) {
        for _ in 0..TX_SPIN_LIMIT {
            if self.transmit_empty() {
                break;
            }
            core::hint::spin_loop();
        }
        self.out(reg::DATA, byte);
    }

    /// Sends one byte, expanding `\n` to `\r\n`.
    pub fn putc(&self, byte: u8) {
        if byte == b'\n' {
            self.send(b'\r');
        }
        self.send(byte);
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        for &b in bytes {
            self.putc(b);
        }
    }
}

impl<P: PortIo> fmt::Write for &SerialPort<P> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

impl<P: PortIo> fmt::Debug for SerialPort<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("base", &format_args!("{:#x}", self.base))
            .field("baud", &self.baud)
            .finish_non_exhaustive()
    }
}
