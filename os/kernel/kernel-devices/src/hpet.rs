//! # HPET Clock Source
//!
//! The main counter of a High Precision Event Timer block. Discovery comes
//! from the ACPI `HPET` table; this driver only needs the register window.

use crate::ProbeError;
use crate::mmio::RegisterBlock;
use crate::timer::{ClockSource, TimerName};
use core::fmt::Write;
use kernel_alloc::region::RegionTracker;
use kernel_memory_addresses::PhysicalAddress;
use log::info;

/// Size of the register window.
pub const HPET_MMIO_SIZE: u64 = 1024;

/// Longest clock period the architecture allows (100 ns).
pub const MAX_PERIOD_FS: u32 = 0x05F5_E100;

mod reg {
    /// General capabilities and ID, low half.
    pub const ID: usize = 0x00;
    /// `COUNTER_CLK_PERIOD`, femtoseconds per tick.
    pub const PERIOD: usize = 0x04;
    pub const CONFIG: usize = 0x10;
    pub const COUNTER: usize = 0xf0;
}

const ID_COUNT_SIZE_64: u32 = 1 << 13;
const CONFIG_ENABLE: u32 = 1 << 0;
const FS_PER_US: u128 = 1_000_000_000;

/// Counter reads allowed for the self-test to see the counter move.
const ADVANCE_POLLS: u32 = 10_000;

pub struct Hpet<R: RegisterBlock> {
    regs: R,
    base: PhysicalAddress,
    name: TimerName,
    counter_64: bool,
    channels: u8,
    period_fs: u32,
}

impl<R: RegisterBlock> Hpet<R> {
    /// Wraps the mapped register window of HPET block `number`.
    #[must_use]
    pub fn new(number: u8, base: PhysicalAddress, regs: R) -> Self {
        let mut name = TimerName::empty();
        let _ = write!(name, "HPET{number}");
        Self {
            regs,
            base,
            name,
            counter_64: false,
            channels: 0,
            period_fs: 0,
        }
    }

    /// Keeps the register window out of every allocator.
    pub fn reserve_mmio(tracker: &mut RegionTracker, base: PhysicalAddress) {
        tracker.add_reserved(base, HPET_MMIO_SIZE);
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Valid after a successful probe.
    #[must_use]
    pub const fn is_64bit(&self) -> bool {
        self.counter_64
    }

    /// Valid after a successful probe.
    #[must_use]
    pub const fn channels(&self) -> u8 {
        self.channels
    }

    /// Valid after a successful probe.
    #[must_use]
    pub const fn period_fs(&self) -> u32 {
        self.period_fs
    }

    fn enable(&self) {
        let config = self.regs.read32(reg::CONFIG);
        self.regs.write32(reg::CONFIG, config | CONFIG_ENABLE);
    }

    fn counter_advances(&self) -> bool {
        let first = self.read_counter();
        (0..ADVANCE_POLLS).any(|_| {
            core::hint::spin_loop();
            self.read_counter() != first
        })
    }
}

impl<R: RegisterBlock> ClockSource for Hpet<R> {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn probe(&mut self) -> Result<(), ProbeError> {
        let id = self.regs.read32(reg::ID);
        let period = self.regs.read32(reg::PERIOD);

        if period == 0 || period > MAX_PERIOD_FS {
            return Err(ProbeError::BadPeriod(period));
        }

        self.counter_64 = id & ID_COUNT_SIZE_64 != 0;
        self.channels = ((id >> 8) & 0x1f) as u8;
        self.period_fs = period;

        self.enable();
        if !self.counter_advances() {
            return Err(ProbeError::CounterStuck);
        }

        info!(
            "{}: {} channel(s) clock period: {} ns {} bit counter",
            self.name,
            self.channels,
            period / 1_000_000,
            if self.counter_64 { 64 } else { 32 }
        );
        Ok(())
    }

    fn read_counter(&self) -> u64 {
        if self.counter_64 {
            self.regs.read64(reg::COUNTER)
        } else {
            u64::from(self.regs.read32(reg::COUNTER))
        }
    }

    fn ticks_for_micros(&self, us: u64) -> u64 {
        let ticks = (u128::from(us) * FS_PER_US)
            .checked_div(u128::from(self.period_fs))
            .unwrap_or(0);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    fn counter_mask(&self) -> u64 {
        if self.counter_64 { u64::MAX } else { 0xffff_ffff }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::fake::FakeRegs;
    use crate::timer::TimerRegistry;

    /// QEMU's HPET: 3 comparators, 64-bit counter, 10 ns period.
    fn qemu_hpet() -> FakeRegs {
        let regs = FakeRegs::with(&[(reg::ID, 0x8086_a201), (reg::PERIOD, 10_000_000)]);
        regs.counter.set(Some((reg::COUNTER, 7)));
        regs
    }

    #[test]
    fn probe_reads_capabilities_and_enables() {
        let regs = qemu_hpet();
        let mut hpet = Hpet::new(0, PhysicalAddress::new(0xfed0_0000), &regs);
        hpet.probe().unwrap();

        assert_eq!(hpet.name(), "HPET0");
        assert!(hpet.is_64bit());
        assert_eq!(hpet.channels(), 2);
        assert_eq!(hpet.period_fs(), 10_000_000);
        assert_eq!(regs.get(reg::CONFIG) & CONFIG_ENABLE, 1);
        assert_eq!(hpet.counter_mask(), u64::MAX);
    }

    #[test]
    fn rejects_bad_period() {
        for period in [0, MAX_PERIOD_FS + 1] {
            let regs = FakeRegs::with(&[(reg::ID, 0x2000), (reg::PERIOD, period)]);
            let mut hpet = Hpet::new(1, PhysicalAddress::new(0), &regs);
            assert_eq!(hpet.probe(), Err(ProbeError::BadPeriod(period)));
            assert!(regs.writes.borrow().is_empty());
        }
    }

    #[test]
    fn rejects_stuck_counter() {
        let regs = FakeRegs::with(&[(reg::ID, 0), (reg::PERIOD, MAX_PERIOD_FS)]);
        let mut hpet = Hpet::new(0, PhysicalAddress::new(0), &regs);
        assert_eq!(hpet.probe(), Err(ProbeError::CounterStuck));
    }

    #[test]
    fn narrow_counter() {
        let regs = FakeRegs::with(&[(reg::ID, 0x0200), (reg::PERIOD, 69_841_279)]);
        regs.counter.set(Some((reg::COUNTER, 1)));
        let mut hpet = Hpet::new(2, PhysicalAddress::new(0), &regs);
        hpet.probe().unwrap();
        assert!(!hpet.is_64bit());
        assert_eq!(hpet.counter_mask(), 0xffff_ffff);
        assert!(!regs.reads.borrow().contains(&(reg::COUNTER + 4)));
    }

    #[test]
    fn micros_to_ticks() {
        let regs = qemu_hpet();
        let mut hpet = Hpet::new(0, PhysicalAddress::new(0), &regs);
        assert_eq!(hpet.ticks_for_micros(10), 0);
        hpet.probe().unwrap();
        assert_eq!(hpet.ticks_for_micros(1), 100);
        assert_eq!(hpet.ticks_for_micros(u64::MAX), u64::MAX);
    }

    #[test]
    fn reserve_marks_register_window() {
        let mut tracker = RegionTracker::new();
        tracker.add_available(PhysicalAddress::new(0), 0x1_0000_0000);
        Hpet::<FakeRegs>::reserve_mmio(&mut tracker, PhysicalAddress::new(0xfed0_0000));
        assert!(tracker.intersects_reserved(PhysicalAddress::new(0xfed0_03ff), 1));
        assert!(!tracker.intersects_reserved(PhysicalAddress::new(0xfed0_0400), 1));
    }

    #[test]
    fn selected_by_registry() {
        let stuck = FakeRegs::with(&[(reg::ID, 0), (reg::PERIOD, 1_000_000)]);
        let good = qemu_hpet();
        let mut a = Hpet::new(0, PhysicalAddress::new(0xfed0_0000), &stuck);
        let mut b = Hpet::new(1, PhysicalAddress::new(0xfed0_1000), &good);
        let mut timers = TimerRegistry::new();
        timers.register(&mut a).unwrap();
        timers.register(&mut b).unwrap();
        assert_eq!(timers.select().unwrap().name(), "HPET1");
        timers.delay_us(2).unwrap();
    }
}
