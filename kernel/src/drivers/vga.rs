//! VGA text-mode driver: an 80x25 writer over a retargetable cell buffer.
//!
//! The writer is deliberately not tied to the live VGA frame at 0xB8000.
//! The terminal registry points it at whichever page the *executing*
//! terminal owns: the live frame when that terminal is displayed, or the
//! terminal's off-screen backing page otherwise. The keyboard handler
//! temporarily re-points it at the live frame so echo always lands on the
//! screen the user is looking at.

use core::fmt;
use spin::Mutex;
use volatile::Volatile;
use x86_64::instructions::port::Port;

pub const VGA_WIDTH: usize = 80;
pub const VGA_HEIGHT: usize = 25;
pub const VGA_CELLS: usize = VGA_WIDTH * VGA_HEIGHT;

/// Physical address of the live VGA text frame.
pub const VGA_FRAME_ADDR: usize = 0xB8000;

const VGA_INDEX_PORT: u16 = 0x3D4;
const VGA_DATA_PORT: u16 = 0x3D5;
const CURSOR_START_REG: u8 = 0x0A;
const CURSOR_LOCATION_HIGH: u8 = 0x0E;
const CURSOR_LOCATION_LOW: u8 = 0x0F;

const DEFAULT_ATTR: u8 = 0x07; // light gray on black

/// One 80x25 page of VGA cells (character | attribute << 8).
#[repr(transparent)]
pub struct Page {
    pub cells: [Volatile<u16>; VGA_CELLS],
}

pub const fn blank_cell() -> u16 {
    ((DEFAULT_ATTR as u16) << 8) | b' ' as u16
}

pub struct Writer {
    base: *mut Page,
    pub x: usize,
    pub y: usize,
    attr: u8,
}

// The raw page pointer is only ever dereferenced under the WRITER lock.
unsafe impl Send for Writer {}

impl Writer {
    pub const fn new(base: *mut Page) -> Writer {
        Writer {
            base,
            x: 0,
            y: 0,
            attr: DEFAULT_ATTR,
        }
    }

    fn page(&mut self) -> &mut Page {
        unsafe { &mut *self.base }
    }

    /// Re-point the writer at another page, keeping the cursor.
    pub fn retarget(&mut self, base: *mut Page) {
        self.base = base;
    }

    pub fn target(&self) -> *mut Page {
        self.base
    }

    /// Restore a saved cursor. `x == VGA_WIDTH` is a legal position (a full
    /// line whose wrap is deferred to the next byte) and must survive a
    /// save/restore round trip, so only values past it are clamped.
    pub fn set_cursor(&mut self, x: usize, y: usize) {
        self.x = x.min(VGA_WIDTH);
        self.y = y.min(VGA_HEIGHT - 1);
    }

    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            b => {
                if self.x >= VGA_WIDTH {
                    self.new_line();
                }
                let idx = self.y * VGA_WIDTH + self.x;
                let v = ((self.attr as u16) << 8) | b as u16;
                self.page().cells[idx].write(v);
                self.x += 1;
            }
        }
    }

    fn new_line(&mut self) {
        self.x = 0;
        if self.y + 1 < VGA_HEIGHT {
            self.y += 1;
            return;
        }
        // scroll up by one line
        let page = self.page();
        for row in 1..VGA_HEIGHT {
            for col in 0..VGA_WIDTH {
                let v = page.cells[row * VGA_WIDTH + col].read();
                page.cells[(row - 1) * VGA_WIDTH + col].write(v);
            }
        }
        for col in 0..VGA_WIDTH {
            page.cells[(VGA_HEIGHT - 1) * VGA_WIDTH + col].write(blank_cell());
        }
    }

    /// Erase the character before the cursor, if any.
    pub fn backspace(&mut self) {
        if self.x == 0 {
            return;
        }
        self.x -= 1;
        let idx = self.y * VGA_WIDTH + self.x;
        self.page().cells[idx].write(blank_cell());
    }

    pub fn clear(&mut self) {
        let page = self.page();
        for cell in page.cells.iter_mut() {
            cell.write(blank_cell());
        }
        self.x = 0;
        self.y = 0;
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7E | b'\n' => self.write_byte(byte),
                _ => self.write_byte(b'?'),
            }
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

static WRITER: Mutex<Writer> = Mutex::new(Writer::new(VGA_FRAME_ADDR as *mut Page));

/// Run `f` with the global writer locked, interrupts disabled for the
/// duration so a keyboard or timer interrupt cannot re-enter it.
pub fn with_writer<R>(f: impl FnOnce(&mut Writer) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| f(&mut WRITER.lock()))
}

pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    with_writer(|w| w.write_fmt(args).ok());
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::drivers::vga::_print(core::format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($fmt:expr) => ($crate::print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::print!(concat!($fmt, "\n"), $($arg)*));
}

/// Enable the hardware cursor.
pub fn cursor_init() {
    unsafe {
        let mut index: Port<u8> = Port::new(VGA_INDEX_PORT);
        let mut data: Port<u8> = Port::new(VGA_DATA_PORT);
        index.write(CURSOR_START_REG);
        let v = data.read();
        index.write(CURSOR_START_REG);
        data.write(v & 0xDF);
    }
}

/// Move the hardware cursor. Only meaningful for the displayed terminal.
pub fn cursor_set(x: usize, y: usize) {
    let pos = (y * VGA_WIDTH + x) as u16;
    unsafe {
        let mut index: Port<u8> = Port::new(VGA_INDEX_PORT);
        let mut data: Port<u8> = Port::new(VGA_DATA_PORT);
        index.write(CURSOR_LOCATION_HIGH);
        data.write((pos >> 8) as u8);
        index.write(CURSOR_LOCATION_LOW);
        data.write(pos as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_page() -> Box<Page> {
        // Volatile<u16> is Clone but not Copy, so no array-repeat here.
        Box::new(Page {
            cells: core::array::from_fn(|_| Volatile::new(blank_cell())),
        })
    }

    fn char_at(page: &Page, x: usize, y: usize) -> u8 {
        (page.cells[y * VGA_WIDTH + x].read() & 0xFF) as u8
    }

    #[test]
    fn writes_advance_cursor() {
        let mut page = test_page();
        let mut w = Writer::new(&mut *page);
        w.write_string("hi");
        assert_eq!(char_at(&page, 0, 0), b'h');
        assert_eq!(char_at(&page, 1, 0), b'i');
    }

    #[test]
    fn newline_and_wrap() {
        let mut page = test_page();
        let mut w = Writer::new(&mut *page);
        w.write_string("a\nb");
        assert_eq!(char_at(&page, 0, 1), b'b');
        assert_eq!((w.x, w.y), (1, 1));

        // column 80 wraps onto the next row
        w.set_cursor(VGA_WIDTH - 1, 1);
        w.write_byte(b'x');
        w.write_byte(b'y');
        assert_eq!(char_at(&page, 0, 2), b'y');
    }

    #[test]
    fn cursor_roundtrip_preserves_pending_wrap() {
        let mut page = test_page();
        let mut w = Writer::new(&mut *page);
        for _ in 0..VGA_WIDTH {
            w.write_byte(b'a');
        }
        assert_eq!((w.x, w.y), (VGA_WIDTH, 0));

        // a terminal switch saves and restores the cursor; the deferred
        // wrap must not be clamped away
        let saved = (w.x, w.y);
        w.set_cursor(saved.0, saved.1);
        w.write_byte(b'B');
        assert_eq!(char_at(&page, VGA_WIDTH - 1, 0), b'a');
        assert_eq!(char_at(&page, 0, 1), b'B');
    }

    #[test]
    fn scrolls_at_bottom() {
        let mut page = test_page();
        let mut w = Writer::new(&mut *page);
        w.set_cursor(0, VGA_HEIGHT - 1);
        w.write_string("last");
        w.write_byte(b'\n');
        // "last" moved up one row, bottom row blank
        assert_eq!(char_at(&page, 0, VGA_HEIGHT - 2), b'l');
        assert_eq!(char_at(&page, 0, VGA_HEIGHT - 1), b' ');
        assert_eq!(w.y, VGA_HEIGHT - 1);
    }

    #[test]
    fn backspace_stops_at_line_start() {
        let mut page = test_page();
        let mut w = Writer::new(&mut *page);
        w.write_string("ab");
        w.backspace();
        assert_eq!(char_at(&page, 1, 0), b' ');
        assert_eq!(w.x, 1);
        w.backspace();
        w.backspace(); // already at column 0, must not underflow
        assert_eq!(w.x, 0);
    }

    #[test]
    fn retarget_switches_pages() {
        let mut a = test_page();
        let mut b = test_page();
        let mut w = Writer::new(&mut *a);
        w.write_byte(b'A');
        w.retarget(&mut *b);
        w.write_byte(b'B');
        assert_eq!(char_at(&a, 0, 0), b'A');
        assert_eq!(char_at(&b, 1, 0), b'B');
    }
}
