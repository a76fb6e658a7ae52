//! Kernel entry point and bring-up order.
//!
//! The loader places the filesystem image in memory and exposes its bounds
//! through linker symbols. Interrupts stay disabled through the whole
//! sequence; the first `sti` is the iretq into the terminal 0 shell.

use core::panic::PanicInfo;

use crate::drivers::{keyboard, pit, rtc, serial};
use crate::mem::paging;
use crate::task::{self, exec};
use crate::{fs, gdt, interrupts, serial_println, terminal};

extern "C" {
    static __filesys_start: u8;
    static __filesys_end: u8;
}

fn fs_image() -> &'static [u8] {
    unsafe {
        let start = &__filesys_start as *const u8;
        let end = &__filesys_end as *const u8;
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    kernel_main()
}

pub fn kernel_main() -> ! {
    gdt::init();
    interrupts::init_idt();
    serial::init();
    serial_println!("triterm-os: gdt/idt/serial up");

    paging::init();
    serial_println!("triterm-os: paging active");

    terminal::init();
    if let Err(e) = fs::init(fs_image()) {
        serial_println!("triterm-os: {}", e);
        halt_forever();
    }
    serial_println!("triterm-os: filesystem mounted");

    task::init();
    pit::init();
    rtc::init();
    keyboard::init();
    interrupts::enable_irq(interrupts::InterruptIndex::Timer.as_irq());
    interrupts::enable_irq(interrupts::InterruptIndex::Keyboard.as_irq());
    interrupts::enable_irq(interrupts::InterruptIndex::Rtc.as_irq());

    serial_println!("triterm-os: starting shell on terminal 0");
    exec::launch_shell(0)
}

fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    serial_println!("kernel panic: {}", info);
    halt_forever()
}
