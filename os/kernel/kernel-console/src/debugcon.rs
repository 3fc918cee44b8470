//! QEMU debug console (`-debugcon`), a write-only byte sink on port `0x402`.

use crate::PortIo;
use core::fmt;

pub const QEMU_DEBUG_PORT: u16 = 0x402;

pub struct DebugCon<P: PortIo> {
    io: P,
}

impl<P: PortIo> DebugCon<P> {
    /// # Safety
    /// Port `0x402` must not belong to another device.
    #[must_use]
    pub const unsafe fn new(io: P) -> Self {
        Self { io }
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        for &b in bytes {
            // SAFETY: constructor precondition.
            unsafe { self.io.outb(QEMU_DEBUG_PORT, b) }
        }
    }
}

impl<P: PortIo> fmt::Write for &DebugCon<P> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

#[cfg(feature = "qemu")]
#[doc(hidden)]
pub mod qemu_fmt {
    use super::DebugCon;
    use crate::NativePorts;
    use core::fmt;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn qemu_write(args: fmt::Arguments) {
        // SAFETY: the debug port is only ever written, by whoever traces.
        let con = unsafe { DebugCon::new(NativePorts) };
        // Best-effort output.
        let _ = fmt::write(&mut &con, args);
    }
}

#[cfg(not(feature = "qemu"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn qemu_write(_: fmt::Arguments) {}
}
