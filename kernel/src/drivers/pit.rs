//! Programmable interval timer: the 100 Hz scheduling clock.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

pub const TICK_HZ: u32 = 100;
const PIT_BASE_HZ: u32 = 1_193_182;

const CHANNEL0_PORT: u16 = 0x40;
const COMMAND_PORT: u16 = 0x43;
// channel 0, lobyte/hibyte access, square wave
const MODE: u8 = 0x36;

static JIFFIES: AtomicU64 = AtomicU64::new(0);

pub const fn divisor() -> u16 {
    (PIT_BASE_HZ / TICK_HZ) as u16
}

/// Program channel 0 for the scheduling rate.
pub fn init() {
    let divisor = divisor();
    unsafe {
        Port::<u8>::new(COMMAND_PORT).write(MODE);
        Port::<u8>::new(CHANNEL0_PORT).write(divisor as u8);
        Port::<u8>::new(CHANNEL0_PORT).write((divisor >> 8) as u8);
    }
}

pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

/// IRQ0 body, called after the EOI so the rotation can run with the PIC
/// already acknowledged.
pub fn on_tick() {
    JIFFIES.fetch_add(1, Ordering::Relaxed);
    crate::task::scheduler::on_timer_tick();
}
