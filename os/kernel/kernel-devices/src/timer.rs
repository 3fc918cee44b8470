//! # Timer Registry
//!
//! Drivers register [`ClockSource`]s during platform discovery; once
//! discovery is done [`TimerRegistry::select`] probes them in registration
//! order and keeps the first one that passes as the system timer.

use crate::ProbeError;
use core::fmt;
use log::{info, warn};

pub const MAX_TIMERS: usize = 16;

/// A free-running counter usable for busy-wait delays.
pub trait ClockSource {
    fn name(&self) -> &str;

    /// Checks that the hardware is present and sane and starts the counter.
    ///
    /// # Errors
    /// The reason the source is unusable; the registry moves on to the next.
    fn probe(&mut self) -> Result<(), ProbeError>;

    fn read_counter(&self) -> u64;

    /// Counter ticks that make up `us` microseconds.
    fn ticks_for_micros(&self, us: u64) -> u64;

    /// Value at which the counter wraps to zero.
    fn counter_mask(&self) -> u64 {
        u64::MAX
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TimerError {
    #[error("No TIMER")]
    NoTimer,
    #[error("timer registry is full")]
    Full,
}

pub struct TimerRegistry<'t> {
    sources: [Option<&'t mut dyn ClockSource>; MAX_TIMERS],
    len: usize,
    selected: Option<usize>,
}

impl Default for TimerRegistry<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'t> TimerRegistry<'t> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sources: [const { None }; MAX_TIMERS],
            len: 0,
            selected: None,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds a candidate. Candidates are probed in the order they arrive.
    ///
    /// # Errors
    /// [`TimerError::Full`] once [`MAX_TIMERS`] are registered.
    pub fn register(&mut self, source: &'t mut dyn ClockSource) -> Result<(), TimerError> {
        let slot = self.sources.get_mut(self.len).ok_or(TimerError::Full)?;
        info!("timer: registered {}", source.name());
        *slot = Some(source);
        self.len += 1;
        Ok(())
    }

    /// Probes the registered sources and selects the first that passes.
    ///
    /// # Errors
    /// [`TimerError::NoTimer`] when every candidate fails or none exists.
    pub fn select(&mut self) -> Result<&dyn ClockSource, TimerError> {
        self.selected = None;
        for (i, slot) in self.sources[..self.len].iter_mut().enumerate() {
            let Some(source) = slot.as_deref_mut() else {
                continue;
            };
            match source.probe() {
                Ok(()) => {
                    info!("timer: using {}", source.name());
                    self.selected = Some(i);
                    break;
                }
                Err(e) => warn!("timer: {} rejected: {e}", source.name()),
            }
        }
        self.selected().ok_or(TimerError::NoTimer)
    }

    #[must_use]
    pub fn selected(&self) -> Option<&dyn ClockSource> {
        self.selected.and_then(|i| self.sources[i].as_deref())
    }

    /// Busy-waits at least `us` microseconds on the selected source.
    ///
    /// Elapsed ticks are summed read by read, so waits longer than one
    /// counter period end too.
    ///
    /// # Errors
    /// [`TimerError::NoTimer`] before a successful [`select`](Self::select).
    pub fn delay_us(&self, us: u64) -> Result<(), TimerError> {
        let source = self.selected().ok_or(TimerError::NoTimer)?;
        let ticks = source.ticks_for_micros(us);
        let mask = source.counter_mask();
        let mut last = source.read_counter();
        let mut elapsed = 0u64;
        while elapsed < ticks {
            core::hint::spin_loop();
            let now = source.read_counter();
            elapsed = elapsed.saturating_add(now.wrapping_sub(last) & mask);
            last = now;
        }
        Ok(())
    }
}

impl fmt::Debug for TimerRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for source in self.sources[..self.len].iter().flatten() {
            list.entry(&source.name());
        }
        list.finish()
    }
}

/// Fixed-capacity device name such as `HPET0`. Longer names are truncated.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TimerName {
    buf: [u8; 16],
    len: usize,
}

impl TimerName {
    #[must_use]
    pub const fn empty() -> Self {
        Self { buf: [0; 16], len: 0 }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("?")
    }
}

impl fmt::Write for TimerName {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            let mut tmp = [0u8; 4];
            let enc = c.encode_utf8(&mut tmp).as_bytes();
            let Some(dst) = self.buf.get_mut(self.len..self.len + enc.len()) else {
                break;
            };
            dst.copy_from_slice(enc);
            self.len += enc.len();
        }
        Ok(())
    }
}

impl fmt::Debug for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
