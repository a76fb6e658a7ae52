//! Virtualized RTC device.
//!
//! The hardware ticks at a fixed 1024 Hz; each open descriptor carries its
//! own virtual rate as a tick interval. A read blocks for one virtual
//! period, so concurrent opens at different rates never disturb each other
//! or reprogram the hardware.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use crate::arch::x86_64 as arch;
use crate::task::fd::{FdEntry, FileOps};

const INDEX_PORT: u16 = 0x70;
const DATA_PORT: u16 = 0x71;
// NMI stays masked while selecting registers
const REG_A: u8 = 0x8A;
const REG_B: u8 = 0x8B;
const REG_C: u8 = 0x0C;

/// Hardware periodic rate: 32768 >> (6 - 1).
pub const HW_HZ: u32 = 1024;
const HW_RATE: u8 = 6;

pub const DEFAULT_HZ: u32 = 2;
pub const MAX_HZ: u32 = 1024;

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Virtual rate -> hardware-tick interval. Only powers of two in
/// `2..=1024` are valid rates.
pub fn interval_for(freq: u32) -> Option<usize> {
    if freq.is_power_of_two() && (2..=MAX_HZ).contains(&freq) {
        Some((HW_HZ / freq) as usize)
    } else {
        None
    }
}

/// Enable the periodic interrupt at the fixed hardware rate.
pub fn init() {
    unsafe {
        let mut index = Port::<u8>::new(INDEX_PORT);
        let mut data = Port::<u8>::new(DATA_PORT);

        index.write(REG_A);
        let prev = data.read();
        index.write(REG_A);
        data.write((prev & 0xF0) | HW_RATE);

        index.write(REG_B);
        let prev = data.read();
        index.write(REG_B);
        data.write(prev | 0x40);
    }
}

/// IRQ8 body: count the tick and rearm by draining register C.
pub fn on_interrupt() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    unsafe {
        Port::<u8>::new(INDEX_PORT).write(REG_C);
        let _ = Port::<u8>::new(DATA_PORT).read();
    }
}

/// The RTC as a file: open at 2 Hz, write a rate, read one period.
pub struct RtcOps;

pub static RTC_OPS: RtcOps = RtcOps;

impl FileOps for RtcOps {
    fn open(&self, fd: &mut FdEntry) -> isize {
        match interval_for(DEFAULT_HZ) {
            Some(interval) => {
                fd.file_pos = interval;
                0
            }
            None => -1,
        }
    }

    /// Block until this descriptor's next virtual tick, then return 0.
    fn read(&self, fd: &mut FdEntry, _buf: &mut [u8]) -> isize {
        let target = ticks() + fd.file_pos as u64;
        while ticks() < target {
            x86_64::instructions::interrupts::enable();
            arch::halt_until_interrupt();
        }
        x86_64::instructions::interrupts::disable();
        0
    }

    /// Accept a 4-byte little-endian rate; reject anything that is not a
    /// power of two in range.
    fn write(&self, fd: &mut FdEntry, buf: &[u8]) -> isize {
        if buf.len() < 4 {
            return -1;
        }
        let freq = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match interval_for(freq) {
            Some(interval) => {
                fd.file_pos = interval;
                4
            }
            None => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_in_range_powers_of_two_are_rates() {
        assert_eq!(interval_for(2), Some(512));
        assert_eq!(interval_for(1024), Some(1));
        assert_eq!(interval_for(64), Some(16));
        for bad in [0, 1, 3, 6, 100, 2048, 4096] {
            assert_eq!(interval_for(bad), None, "{} accepted", bad);
        }
    }

    #[test]
    fn open_starts_every_descriptor_at_2hz() {
        let mut fd = FdEntry::empty();
        assert_eq!(RTC_OPS.open(&mut fd), 0);
        assert_eq!(fd.file_pos, 512);
    }

    #[test]
    fn write_sets_the_virtual_rate_per_descriptor() {
        let mut a = FdEntry::empty();
        let mut b = FdEntry::empty();
        RTC_OPS.open(&mut a);
        RTC_OPS.open(&mut b);

        assert_eq!(RTC_OPS.write(&mut a, &128u32.to_le_bytes()), 4);
        assert_eq!(a.file_pos, 8);
        // b keeps its own rate
        assert_eq!(b.file_pos, 512);

        // invalid rates leave the descriptor untouched
        assert_eq!(RTC_OPS.write(&mut a, &3u32.to_le_bytes()), -1);
        assert_eq!(a.file_pos, 8);
        assert_eq!(RTC_OPS.write(&mut a, &[2, 0]), -1);
    }
}
