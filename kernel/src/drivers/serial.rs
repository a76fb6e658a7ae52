//! Serial Port (COM1) driver for kernel logging.
//!
//! All boot progress, task lifecycle and fault reports go here so they stay
//! visible regardless of which terminal is displayed on the VGA screen.

use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

static SERIAL: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1) });

/// Initialize COM1. Safe to call before interrupts are enabled.
pub fn init() {
    SERIAL.lock().init();
}

#[cfg(not(test))]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    x86_64::instructions::interrupts::without_interrupts(|| {
        SERIAL.lock().write_fmt(args).ok();
    });
}

// On the host, route kernel logs to stdout so failing tests show them.
#[cfg(test)]
pub fn _print(args: core::fmt::Arguments) {
    std::print!("{}", args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::drivers::serial::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(concat!($fmt, "\n"), $($arg)*));
}
