//! Terminal registry: three independent sessions, each with its own line
//! buffer, cursor and off-screen backing page.
//!
//! Two ids in [`TerminalSet`] never have to agree: `displayed` names the
//! terminal whose content sits in the live VGA frame, `executing` names the
//! terminal whose foreground task owns the CPU. F-key switches move only
//! `displayed`; the scheduler moves only `executing`.

use spin::Mutex;

use crate::drivers::vga::{self, Page, Writer, VGA_FRAME_ADDR};
use crate::task::fd::{FdEntry, FileOps};

pub const TERMINAL_COUNT: usize = 3;
pub const INPUT_BUF_LEN: usize = 128;

/// Off-screen pages holding non-displayed terminal content, one 4 KiB page
/// per terminal directly above the live VGA frame.
pub const BACKING_PAGE_BASE: usize = VGA_FRAME_ADDR + 0x1000;

pub fn backing_page_addr(id: usize) -> usize {
    BACKING_PAGE_BASE + id * 0x1000
}

/// Line-discipline state fed by the keyboard handler and drained by
/// terminal reads. The last buffer byte is reserved for the trailing '\n'.
pub struct LineBuffer {
    buf: [u8; INPUT_BUF_LEN],
    len: usize,
    ready: bool,
}

impl LineBuffer {
    pub const fn new() -> LineBuffer {
        LineBuffer {
            buf: [0; INPUT_BUF_LEN],
            len: 0,
            ready: false,
        }
    }

    /// Append a typed byte. Returns false (and drops the byte) when the
    /// buffer is full or a finished line is still waiting to be consumed.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.ready || self.len >= INPUT_BUF_LEN - 1 {
            return false;
        }
        self.buf[self.len] = byte;
        self.len += 1;
        true
    }

    /// Remove the last typed byte. Returns false at the start of the line.
    pub fn backspace(&mut self) -> bool {
        if self.ready || self.len == 0 {
            return false;
        }
        self.len -= 1;
        true
    }

    /// Terminate the line with '\n' and mark it ready for readers.
    pub fn finish(&mut self) {
        if self.ready {
            return;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Drain the finished line into `out`, up to `out.len()` bytes including
    /// the '\n'. Resets the buffer for the next line.
    pub fn take_line(&mut self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.len = 0;
        self.ready = false;
        n
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.ready = false;
    }
}

pub struct Terminal {
    pub input: LineBuffer,
    pub cursor_x: usize,
    pub cursor_y: usize,
    /// Pid of this terminal's foreground task, -1 when the terminal has no
    /// task yet and a shell must be launched for it.
    pub foreground_pid: i32,
}

impl Terminal {
    pub const fn new() -> Terminal {
        Terminal {
            input: LineBuffer::new(),
            cursor_x: 0,
            cursor_y: 0,
            foreground_pid: -1,
        }
    }

    pub fn reset(&mut self) {
        self.input.reset();
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.foreground_pid = -1;
    }
}

pub struct TerminalSet {
    terminals: [Terminal; TERMINAL_COUNT],
    displayed: usize,
    executing: usize,
}

impl TerminalSet {
    pub const fn new() -> TerminalSet {
        const T: Terminal = Terminal::new();
        TerminalSet {
            terminals: [T; TERMINAL_COUNT],
            displayed: 0,
            executing: 0,
        }
    }

    pub fn displayed(&self) -> usize {
        self.displayed
    }

    pub fn executing(&self) -> usize {
        self.executing
    }

    pub fn terminal(&self, id: usize) -> &Terminal {
        &self.terminals[id]
    }

    pub fn terminal_mut(&mut self, id: usize) -> &mut Terminal {
        &mut self.terminals[id]
    }

    /// Record a display switch. Page contents are moved separately by
    /// [`swap_display_contents`]; this only flips the id. Returns the
    /// previously displayed terminal, or None when `id` already was it.
    pub fn set_displayed(&mut self, id: usize) -> Option<usize> {
        if id >= TERMINAL_COUNT || id == self.displayed {
            return None;
        }
        let old = self.displayed;
        self.displayed = id;
        Some(old)
    }

    /// Record an executing-terminal switch. Returns the previous executing
    /// terminal, or None when `id` already was it.
    pub fn set_executing(&mut self, id: usize) -> Option<usize> {
        if id >= TERMINAL_COUNT || id == self.executing {
            return None;
        }
        let old = self.executing;
        self.executing = id;
        Some(old)
    }
}

/// Move the live frame's content into the outgoing terminal's backing page
/// and the incoming terminal's saved content onto the live frame.
pub fn swap_display_contents(live: &mut Page, old_backing: &mut Page, new_backing: &Page) {
    for i in 0..vga::VGA_CELLS {
        old_backing.cells[i].write(live.cells[i].read());
        live.cells[i].write(new_backing.cells[i].read());
    }
}

pub static TERMINALS: Mutex<TerminalSet> = Mutex::new(TerminalSet::new());

pub fn displayed_id() -> usize {
    TERMINALS.lock().displayed()
}

pub fn executing_id() -> usize {
    TERMINALS.lock().executing()
}

/// The page the executing terminal's output must land on: the live frame
/// when it is displayed, its backing page otherwise.
fn output_page(executing: usize, displayed: usize) -> *mut Page {
    if executing == displayed {
        VGA_FRAME_ADDR as *mut Page
    } else {
        backing_page_addr(executing) as *mut Page
    }
}

unsafe fn page_at(addr: usize) -> &'static mut Page {
    &mut *(addr as *mut Page)
}

/// Clear every session and its backing page. Called once at boot, before
/// interrupts are enabled.
pub fn init() {
    let mut terms = TERMINALS.lock();
    for id in 0..TERMINAL_COUNT {
        terms.terminal_mut(id).reset();
        let backing = unsafe { page_at(backing_page_addr(id)) };
        for cell in backing.cells.iter_mut() {
            cell.write(vga::blank_cell());
        }
    }
    drop(terms);
    vga::with_writer(|w| {
        w.retarget(VGA_FRAME_ADDR as *mut Page);
        w.clear();
    });
    vga::cursor_init();
    vga::cursor_set(0, 0);
}

/// Switch the displayed terminal (Alt+F1..F3 path). Swaps page contents,
/// re-points the writer and the executing task's vidmap window, and
/// restores the incoming terminal's hardware cursor. Never touches which
/// terminal is executing.
pub fn switch_displayed(id: usize) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut terms = TERMINALS.lock();
        let old = match terms.set_displayed(id) {
            Some(old) => old,
            None => return,
        };
        unsafe {
            swap_display_contents(
                page_at(VGA_FRAME_ADDR),
                page_at(backing_page_addr(old)),
                page_at(backing_page_addr(id)),
            );
        }
        let executing = terms.executing();
        let cursor = {
            let t = terms.terminal(id);
            (t.cursor_x, t.cursor_y)
        };
        drop(terms);

        // The executing terminal's output target may have changed sides.
        vga::with_writer(|w| w.retarget(output_page(executing, id)));

        // Keep the executing task's vidmap window tracking the display.
        crate::task::remap_current(id);

        if executing == id {
            // The live cursor for this terminal is in the writer.
            let (x, y) = vga::with_writer(|w| (w.x, w.y));
            vga::cursor_set(x, y);
        } else {
            vga::cursor_set(cursor.0, cursor.1);
        }
    });
}

/// Run `f` against the *displayed* terminal's screen, regardless of which
/// terminal is executing. Used by the keyboard handler so echo always lands
/// on the screen the user is looking at. Saves and restores the executing
/// terminal's writer state around the call.
pub fn with_displayed_output<R>(f: impl FnOnce(&mut Writer) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut terms = TERMINALS.lock();
        let displayed = terms.displayed();
        let executing = terms.executing();

        if displayed == executing {
            let r = vga::with_writer(|w| f(w));
            let (x, y) = vga::with_writer(|w| (w.x, w.y));
            vga::cursor_set(x, y);
            return r;
        }

        let (dx, dy) = {
            let t = terms.terminal(displayed);
            (t.cursor_x, t.cursor_y)
        };
        let (r, nx, ny) = vga::with_writer(|w| {
            let saved_target = w.target();
            let saved_cursor = (w.x, w.y);
            w.retarget(VGA_FRAME_ADDR as *mut Page);
            w.set_cursor(dx, dy);
            let r = f(w);
            let end = (w.x, w.y);
            w.retarget(saved_target);
            w.set_cursor(saved_cursor.0, saved_cursor.1);
            (r, end.0, end.1)
        });
        let t = terms.terminal_mut(displayed);
        t.cursor_x = nx;
        t.cursor_y = ny;
        vga::cursor_set(nx, ny);
        r
    })
}

/// Feed one decoded keystroke into the displayed terminal's line buffer,
/// echoing onto the displayed screen.
pub fn handle_input_byte(byte: u8) {
    let displayed = displayed_id();
    match byte {
        0x08 => {
            let erased = TERMINALS.lock().terminal_mut(displayed).input.backspace();
            if erased {
                with_displayed_output(|w| w.backspace());
            }
        }
        b'\n' => {
            TERMINALS.lock().terminal_mut(displayed).input.finish();
            with_displayed_output(|w| w.write_byte(b'\n'));
        }
        0x20..=0x7E => {
            let stored = TERMINALS.lock().terminal_mut(displayed).input.push(byte);
            if stored {
                with_displayed_output(|w| w.write_byte(byte));
            }
        }
        _ => {}
    }
}

/// Executing-terminal handoff for the writer: save the outgoing terminal's
/// cursor, then point the writer at the incoming terminal's output page
/// with its saved cursor. Called by the scheduler on every rotation.
pub fn writer_follow_executing(old_id: usize, new_id: usize) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut terms = TERMINALS.lock();
        let displayed = terms.displayed();
        let (ox, oy) = vga::with_writer(|w| (w.x, w.y));
        {
            let t = terms.terminal_mut(old_id);
            t.cursor_x = ox;
            t.cursor_y = oy;
        }
        let (nx, ny) = {
            let t = terms.terminal(new_id);
            (t.cursor_x, t.cursor_y)
        };
        drop(terms);
        vga::with_writer(|w| {
            w.retarget(output_page(new_id, displayed));
            w.set_cursor(nx, ny);
        });
        if new_id == displayed {
            vga::cursor_set(nx, ny);
        }
    });
}

/// Clear the displayed terminal's screen (Ctrl+L).
pub fn clear_displayed() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut terms = TERMINALS.lock();
        let displayed = terms.displayed();
        let executing = terms.executing();
        if displayed == executing {
            drop(terms);
            vga::with_writer(|w| w.clear());
            vga::cursor_set(0, 0);
        } else {
            let live = unsafe { page_at(VGA_FRAME_ADDR) };
            for cell in live.cells.iter_mut() {
                cell.write(vga::blank_cell());
            }
            let t = terms.terminal_mut(displayed);
            t.cursor_x = 0;
            t.cursor_y = 0;
            vga::cursor_set(0, 0);
        }
    });
}

/// Standard input: blocking line reads from the reading task's terminal.
pub struct TermStdin;

/// Standard output: writes onto the executing terminal's output page.
pub struct TermStdout;

pub static STDIN_OPS: TermStdin = TermStdin;
pub static STDOUT_OPS: TermStdout = TermStdout;

impl FileOps for TermStdin {
    fn read(&self, _fd: &mut FdEntry, buf: &mut [u8]) -> isize {
        // Halt-and-poll with interrupts enabled: the wakeup is the keyboard
        // interrupt finishing a line, but any interrupt re-checks.
        loop {
            let done = x86_64::instructions::interrupts::without_interrupts(|| {
                let mut terms = TERMINALS.lock();
                let id = terms.executing();
                let input = &mut terms.terminal_mut(id).input;
                if input.is_ready() {
                    Some(input.take_line(buf))
                } else {
                    None
                }
            });
            if let Some(n) = done {
                // back to IF-clear before the syscall path touches locks
                // the scheduler also takes
                x86_64::instructions::interrupts::disable();
                return n as isize;
            }
            x86_64::instructions::interrupts::enable();
            crate::arch::x86_64::halt_until_interrupt();
        }
    }

    fn write(&self, _fd: &mut FdEntry, _buf: &[u8]) -> isize {
        -1
    }
}

impl FileOps for TermStdout {
    fn read(&self, _fd: &mut FdEntry, _buf: &mut [u8]) -> isize {
        -1
    }

    fn write(&self, _fd: &mut FdEntry, buf: &[u8]) -> isize {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let terms = TERMINALS.lock();
            let on_screen = terms.executing() == terms.displayed();
            drop(terms);
            let (x, y) = vga::with_writer(|w| {
                for &b in buf {
                    w.write_byte(b);
                }
                (w.x, w.y)
            });
            if on_screen {
                vga::cursor_set(x, y);
            }
        });
        buf.len() as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_accepts_up_to_127_bytes() {
        let mut lb = LineBuffer::new();
        for i in 0..INPUT_BUF_LEN - 1 {
            assert!(lb.push(b'a'), "byte {} rejected", i);
        }
        // last slot is reserved for the newline
        assert!(!lb.push(b'x'));
        lb.finish();
        let mut out = [0u8; INPUT_BUF_LEN];
        let n = lb.take_line(&mut out);
        assert_eq!(n, INPUT_BUF_LEN);
        assert_eq!(out[INPUT_BUF_LEN - 1], b'\n');
    }

    #[test]
    fn backspace_erases_and_stops_at_empty() {
        let mut lb = LineBuffer::new();
        assert!(!lb.backspace());
        lb.push(b'h');
        lb.push(b'i');
        assert!(lb.backspace());
        lb.finish();
        let mut out = [0u8; 8];
        let n = lb.take_line(&mut out);
        assert_eq!(&out[..n], b"h\n");
    }

    #[test]
    fn finished_line_blocks_further_input_until_taken() {
        let mut lb = LineBuffer::new();
        lb.push(b'o');
        lb.push(b'k');
        lb.finish();
        assert!(lb.is_ready());
        assert!(!lb.push(b'z'));
        assert!(!lb.backspace());
        let mut out = [0u8; 8];
        assert_eq!(lb.take_line(&mut out), 3);
        assert!(!lb.is_ready());
        assert!(lb.push(b'z'));
    }

    #[test]
    fn take_line_caps_at_reader_buffer() {
        let mut lb = LineBuffer::new();
        for b in b"hello" {
            lb.push(*b);
        }
        lb.finish();
        let mut out = [0u8; 3];
        assert_eq!(lb.take_line(&mut out), 3);
        assert_eq!(&out, b"hel");
    }

    #[test]
    fn displayed_and_executing_switch_independently() {
        let mut set = TerminalSet::new();
        assert_eq!(set.displayed(), 0);
        assert_eq!(set.executing(), 0);

        assert_eq!(set.set_displayed(2), Some(0));
        assert_eq!(set.executing(), 0, "display switch must not move executing");

        assert_eq!(set.set_executing(1), Some(0));
        assert_eq!(set.displayed(), 2, "executing switch must not move displayed");

        // no-op switches
        assert_eq!(set.set_displayed(2), None);
        assert_eq!(set.set_executing(1), None);
        // out of range
        assert_eq!(set.set_displayed(TERMINAL_COUNT), None);
    }

    #[test]
    fn swap_display_contents_round_trips() {
        use crate::drivers::vga::Page;
        use volatile::Volatile;

        fn page_filled(v: u16) -> Box<Page> {
            Box::new(Page {
                cells: core::array::from_fn(|_| Volatile::new(v)),
            })
        }

        let mut live = page_filled(0xAAAA);
        let mut old_backing = page_filled(0);
        let new_backing = page_filled(0xBBBB);

        swap_display_contents(&mut live, &mut old_backing, &new_backing);

        // the live frame now shows the incoming terminal's saved page, and
        // the outgoing terminal's page holds what was on screen
        assert!(live.cells.iter().all(|c| c.read() == 0xBBBB));
        assert!(old_backing.cells.iter().all(|c| c.read() == 0xAAAA));
    }
}
