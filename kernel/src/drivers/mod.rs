pub mod keyboard;
pub mod pit;
pub mod rtc;
pub mod serial;
pub mod vga;
