//! Program launch and exit.
//!
//! `execute` blocks the caller until the launched task halts: the parent's
//! kernel context is parked in its PCB, the child runs, and `halt` resumes
//! the parent with the child's status as `execute`'s return value. Root
//! shells have no parent to resume, so their halt restarts the shell on the
//! same terminal instead.

use core::sync::atomic::AtomicUsize;

use crate::arch::x86_64 as arch;
use crate::fs;
use crate::gdt;
use crate::mem::paging::{self, IMAGE_LOAD_VIRT, USER_IMAGE_SIZE, USER_IMAGE_VIRT};
use crate::serial_println;
use crate::task::{self, fd::FdTable, ARGS_LEN, TASKS};
use crate::terminal::{self, TERMINALS};

/// Status reported for a task torn down by an exception rather than a halt
/// call; one past the largest value user code can pass.
pub const FAULT_STATUS: usize = 256;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ENTRY_OFFSET: usize = 24;
const HEADER_LEN: usize = 28;
const SHELL_CMD: &[u8] = b"shell";

/// Initial user stack pointer, at the top of the 4 MiB image window.
pub const USER_STACK_TOP: usize = USER_IMAGE_VIRT + USER_IMAGE_SIZE - 16;

// Root shells park their launch context here. It is never resumed: a root
// shell's halt goes through the restart path, not halt_return.
static ROOT_CONTEXT_SINK: AtomicUsize = AtomicUsize::new(0);

/// Split a command line into program name and argument string. Leading and
/// trailing whitespace is ignored; the argument string keeps its internal
/// spacing.
pub fn parse_command(cmd: &[u8]) -> Result<(&[u8], &[u8]), &'static str> {
    let cmd = trim(cmd);
    if cmd.is_empty() {
        return Err("empty command");
    }
    let split = cmd.iter().position(|&b| b == b' ').unwrap_or(cmd.len());
    let (name, rest) = cmd.split_at(split);
    let args = trim(rest);
    if args.len() >= ARGS_LEN {
        return Err("arguments too long");
    }
    Ok((name, args))
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(s.len());
    let end = s
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &s[start..end]
}

/// Validate an executable header and extract its entry point: the 4-byte
/// magic, then a little-endian entry address at byte 24 that must lie
/// inside the user image window.
pub fn check_executable(header: &[u8]) -> Result<usize, &'static str> {
    if header.len() < HEADER_LEN || header[..4] != ELF_MAGIC {
        return Err("not an executable");
    }
    let entry = u32::from_le_bytes([
        header[ENTRY_OFFSET],
        header[ENTRY_OFFSET + 1],
        header[ENTRY_OFFSET + 2],
        header[ENTRY_OFFSET + 3],
    ]) as usize;
    if !(USER_IMAGE_VIRT..USER_IMAGE_VIRT + USER_IMAGE_SIZE).contains(&entry) {
        return Err("entry point outside the user window");
    }
    Ok(entry)
}

/// Copy the program image into task `pid`'s physical frame through the
/// identity mapping, at the fixed load offset inside the window.
fn load_image(pid: usize, inode: u32) -> Result<(), &'static str> {
    let offset = IMAGE_LOAD_VIRT - USER_IMAGE_VIRT;
    let capacity = USER_IMAGE_SIZE - offset;
    let len = fs::fs().inode_len(inode)?;
    if len > capacity {
        return Err("image too large for the user window");
    }
    let frame = (paging::user_frame_addr(pid) as usize + offset) as *mut u8;
    let dst = unsafe { core::slice::from_raw_parts_mut(frame, len) };
    let copied = fs::fs().read_data(inode, 0, dst)?;
    if copied != len {
        return Err("short image read");
    }
    Ok(())
}

/// Launch `cmd` and block until it halts. Returns the child's halt status,
/// or -1 on any launch failure (with the task slot rolled back).
pub fn execute(cmd: &[u8]) -> isize {
    do_execute(cmd, None)
}

fn do_execute(cmd: &[u8], root_terminal: Option<usize>) -> isize {
    match try_execute(cmd, root_terminal) {
        Ok(status) => status,
        Err(msg) => {
            serial_println!("execute: {}", msg);
            -1
        }
    }
}

fn try_execute(cmd: &[u8], root_terminal: Option<usize>) -> Result<isize, &'static str> {
    let (name, args) = parse_command(cmd)?;
    let dentry = fs::fs().dentry_by_name(name).ok_or("no such program")?;
    if dentry.file_type != fs::TYPE_FILE {
        return Err("not a regular file");
    }
    let mut header = [0u8; HEADER_LEN];
    if fs::fs().read_data(dentry.inode, 0, &mut header)? < HEADER_LEN {
        return Err("image too short");
    }
    let entry = check_executable(&header)?;

    let parent = task::current_pid();
    let terminal = match root_terminal {
        Some(t) => t,
        None => TASKS
            .lock()
            .get(parent.max(0) as usize)
            .filter(|_| parent >= 0)
            .map(|p| p.terminal_id)
            .ok_or("no calling task")?,
    };

    let pid = {
        let mut tasks = TASKS.lock();
        let pid = tasks.allocate().ok_or("task table full")?;
        if let Some(pcb) = tasks.get_mut(pid) {
            pcb.parent_pid = if root_terminal.is_some() { -1 } else { parent };
            pcb.terminal_id = terminal;
            pcb.fds = FdTable::new_for_task(&terminal::STDIN_OPS, &terminal::STDOUT_OPS);
            pcb.args[..args.len()].copy_from_slice(args);
            pcb.args_len = args.len();
        }
        pid
    };

    // The frame is reached through the identity mapping, so the image can
    // be loaded before the child's address space is installed.
    if let Err(e) = load_image(pid, dentry.inode) {
        TASKS.lock().free(pid);
        return Err(e);
    }
    if let Err(e) = paging::remap(pid, false, terminal, terminal::displayed_id()) {
        TASKS.lock().free(pid);
        return Err(e);
    }

    TERMINALS.lock().terminal_mut(terminal).foreground_pid = pid as i32;
    gdt::set_kernel_stack(task::kernel_stack_top(pid));
    task::set_current_pid(pid as i32);

    let save_sp: *mut usize = if root_terminal.is_some() {
        ROOT_CONTEXT_SINK.as_ptr()
    } else {
        let mut tasks = TASKS.lock();
        let pcb = tasks
            .get_mut(parent as usize)
            .ok_or("parent task vanished")?;
        &mut pcb.context.sp as *mut usize
    };

    // Drops to ring 3; comes back only when the child halts.
    let status = unsafe { arch::user_launch(save_sp, entry, USER_STACK_TOP) };
    Ok(status)
}

/// Tear down the current task and deliver `status` to its parent. Does not
/// return: control moves to the parent's suspended `execute` call, or to a
/// fresh shell when a terminal's root shell exits.
pub fn halt(status: usize) -> ! {
    x86_64::instructions::interrupts::disable();

    let pid = task::current_pid();
    if pid < 0 {
        serial_println!("halt with no running task");
        loop {
            arch::halt_until_interrupt();
        }
    }
    let pid = pid as usize;

    let (parent, terminal) = {
        let mut tasks = TASKS.lock();
        let ids = match tasks.get_mut(pid) {
            Some(pcb) => {
                pcb.fds.close_all();
                (pcb.parent_pid, pcb.terminal_id)
            }
            None => (-1, terminal::executing_id()),
        };
        tasks.free(pid);
        ids
    };
    TERMINALS.lock().terminal_mut(terminal).foreground_pid = parent;

    if parent < 0 {
        serial_println!("terminal {}: root shell exited, restarting", terminal);
        task::set_current_pid(-1);
        launch_shell(terminal);
    }

    let resume = {
        let tasks = TASKS.lock();
        tasks
            .get(parent as usize)
            .map(|p| (p.context.sp, p.vidmapped, p.terminal_id))
    };
    let (resume_sp, vidmapped, parent_terminal) = match resume {
        Some(r) => r,
        None => {
            serial_println!("halt: parent {} vanished, restarting shell", parent);
            task::set_current_pid(-1);
            launch_shell(terminal);
        }
    };

    gdt::set_kernel_stack(task::kernel_stack_top(parent as usize));
    let _ = paging::remap(
        parent as usize,
        vidmapped,
        parent_terminal,
        terminal::displayed_id(),
    );
    task::set_current_pid(parent);
    unsafe { arch::halt_return(resume_sp, status as isize) }
}

/// Exception path: tear the faulting task down with a status user code
/// cannot produce.
pub fn fault_halt() -> ! {
    halt(FAULT_STATUS)
}

/// Run a root shell on `terminal`, restarting it whenever it exits.
pub fn launch_shell(terminal: usize) -> ! {
    loop {
        let status = do_execute(SHELL_CMD, Some(terminal));
        if status < 0 {
            serial_println!("terminal {}: cannot start shell", terminal);
            loop {
                arch::halt_until_interrupt();
            }
        }
        serial_println!(
            "terminal {}: shell exited with status {}, restarting",
            terminal,
            status
        );
    }
}

/// Entry point handed to `save_and_call` when the scheduler rotates onto a
/// terminal that has no shell yet.
pub extern "sysv64" fn shell_bootstrap(terminal: usize) -> ! {
    launch_shell(terminal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing_splits_name_and_args() {
        let (name, args) = parse_command(b"  cat   frame0.txt\n").unwrap();
        assert_eq!(name, b"cat");
        assert_eq!(args, b"frame0.txt");

        let (name, args) = parse_command(b"shell").unwrap();
        assert_eq!(name, b"shell");
        assert_eq!(args, b"");

        // internal spacing of the argument string is preserved
        let (_, args) = parse_command(b"grep a  b").unwrap();
        assert_eq!(args, b"a  b");
    }

    #[test]
    fn empty_and_oversized_commands_are_rejected() {
        assert!(parse_command(b"").is_err());
        assert!(parse_command(b"   \n").is_err());

        let mut long = vec![b'p', b' '];
        long.extend(core::iter::repeat(b'a').take(ARGS_LEN));
        assert!(parse_command(&long).is_err());
    }

    fn header_with_entry(entry: u32) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[..4].copy_from_slice(&ELF_MAGIC);
        h[ENTRY_OFFSET..ENTRY_OFFSET + 4].copy_from_slice(&entry.to_le_bytes());
        h
    }

    #[test]
    fn executable_check_reads_the_entry_point() {
        let h = header_with_entry(IMAGE_LOAD_VIRT as u32);
        assert_eq!(check_executable(&h).unwrap(), IMAGE_LOAD_VIRT);
    }

    #[test]
    fn executable_check_rejects_bad_images() {
        // wrong magic
        let mut h = header_with_entry(IMAGE_LOAD_VIRT as u32);
        h[0] = 0x7E;
        assert!(check_executable(&h).is_err());

        // entry outside the user window
        let h = header_with_entry(0x40_0000);
        assert!(check_executable(&h).is_err());
        let h = header_with_entry((USER_IMAGE_VIRT + USER_IMAGE_SIZE) as u32);
        assert!(check_executable(&h).is_err());

        // truncated header
        assert!(check_executable(&[0x7F, b'E', b'L', b'F']).is_err());
    }

    #[test]
    fn user_stack_sits_at_the_top_of_the_window() {
        assert!(USER_STACK_TOP > IMAGE_LOAD_VIRT);
        assert!(USER_STACK_TOP < USER_IMAGE_VIRT + USER_IMAGE_SIZE);
        assert_eq!(USER_STACK_TOP % 16, 0);
    }
}
