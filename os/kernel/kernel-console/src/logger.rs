use crate::{DebugCon, PortIo, SerialPort};
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing `[LEVEL] target: message` lines to the serial port
/// and, when present, the QEMU debug console.
pub struct ConsoleLogger<P: PortIo> {
    serial: SerialPort<P>,
    debugcon: Option<DebugCon<P>>,
    /// Most verbose level this logger ever emits. The runtime level is the
    /// facade's `log::max_level`.
    ceiling: LevelFilter,
}

impl<P: PortIo> ConsoleLogger<P> {
    #[must_use]
    pub const fn new(serial: SerialPort<P>, debugcon: Option<DebugCon<P>>, ceiling: LevelFilter) -> Self {
        Self {
            serial,
            debugcon,
            ceiling,
        }
    }

    #[must_use]
    pub const fn serial(&self) -> &SerialPort<P> {
        &self.serial
    }
}

impl<P: PortIo + Send + Sync + 'static> ConsoleLogger<P> {
    /// Initialises the UART and installs this logger. Call once during
    /// early init.
    ///
    /// # Errors
    /// Fails when another logger is already installed.
    pub fn init(&'static self, level: LevelFilter) -> Result<(), SetLoggerError> {
        self.serial.init();
        log::set_logger(self)?;
        set_level(level.min(self.ceiling));
        Ok(())
    }
}

/// Changes the runtime log level, e.g. from `loglevel=` on the command line.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

impl<P: PortIo + Send + Sync> Log for ConsoleLogger<P> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.ceiling
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _ = writeln!(&self.serial, "[{}] {}: {}", record.level(), record.target(), record.args());
        if let Some(mut con) = self.debugcon.as_ref() {
            let _ = writeln!(con, "[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}
