//! System call surface at vector 0x80.
//!
//! Register convention: call number in rax, arguments in rbx, rcx, rdx,
//! result in rax; anything but a valid call returns -1. The assembly stub
//! preserves the full user register file around the dispatch so blocking
//! calls can rotate through other tasks freely.

use core::arch::global_asm;

use crate::mem::paging::{self, USER_IMAGE_SIZE, USER_IMAGE_VIRT, USER_VIDEO_VIRT};
use crate::task::{self, exec, fd::FdEntry, ARGS_LEN, TASKS};
use crate::terminal;
use crate::{drivers::rtc, fs};

pub const SYS_HALT: usize = 1;
pub const SYS_EXECUTE: usize = 2;
pub const SYS_READ: usize = 3;
pub const SYS_WRITE: usize = 4;
pub const SYS_OPEN: usize = 5;
pub const SYS_CLOSE: usize = 6;
pub const SYS_GETARGS: usize = 7;
pub const SYS_VIDMAP: usize = 8;
pub const SYS_SET_HANDLER: usize = 9;
pub const SYS_SIGRETURN: usize = 10;

global_asm!(
    "
    .global __triterm_syscall_entry

// Vector 0x80 entry. Saves the user register file, rearranges the syscall
// registers into the sysv64 argument order and patches the saved rax slot
// with the result before returning.
__triterm_syscall_entry:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rax
    mov rsi, rbx
    mov r10, rcx
    mov rcx, rdx
    mov rdx, r10
    call {dispatch}
    mov [rsp + 112], rax
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    iretq
",
    dispatch = sym dispatch,
);

extern "C" {
    fn __triterm_syscall_entry();
}

pub fn entry_address() -> u64 {
    __triterm_syscall_entry as usize as u64
}

extern "sysv64" fn dispatch(num: usize, a: usize, b: usize, c: usize) -> isize {
    match num {
        SYS_HALT => exec::halt(a & 0xFF),
        SYS_EXECUTE => sys_execute(a),
        SYS_READ => sys_read(a, b, c),
        SYS_WRITE => sys_write(a, b, c),
        SYS_OPEN => sys_open(a),
        SYS_CLOSE => sys_close(a),
        SYS_GETARGS => sys_getargs(a, b),
        SYS_VIDMAP => sys_vidmap(a),
        // signals are not supported
        SYS_SET_HANDLER | SYS_SIGRETURN => -1,
        _ => -1,
    }
}

/// A user buffer is valid only when it lies entirely inside the 4 MiB
/// image window.
fn valid_user_range(ptr: usize, len: usize) -> bool {
    let end = match ptr.checked_add(len.max(1)) {
        Some(e) => e,
        None => return false,
    };
    ptr >= USER_IMAGE_VIRT && end <= USER_IMAGE_VIRT + USER_IMAGE_SIZE
}

/// Copy a NUL-terminated user string, rejecting unterminated or
/// out-of-window input. Returns the length without the terminator.
fn copy_user_cstr(ptr: usize, out: &mut [u8]) -> Option<usize> {
    for i in 0..out.len() {
        if !valid_user_range(ptr + i, 1) {
            return None;
        }
        let byte = unsafe { *((ptr + i) as *const u8) };
        if byte == 0 {
            return Some(i);
        }
        out[i] = byte;
    }
    None
}

fn current_fd(fd: usize) -> Option<FdEntry> {
    let pid = task::current_pid();
    if pid < 0 {
        return None;
    }
    TASKS
        .lock()
        .get(pid as usize)
        .and_then(|p| p.fds.get(fd))
        .copied()
}

/// Write an entry's updated position back after an unlocked read or write.
fn store_fd(fd: usize, entry: FdEntry) {
    let pid = task::current_pid();
    if pid < 0 {
        return;
    }
    if let Some(pcb) = TASKS.lock().get_mut(pid as usize) {
        if let Some(slot) = pcb.fds.get_mut(fd) {
            *slot = entry;
        }
    }
}

fn sys_execute(cmd_ptr: usize) -> isize {
    let mut cmd = [0u8; ARGS_LEN];
    match copy_user_cstr(cmd_ptr, &mut cmd) {
        Some(n) => exec::execute(&cmd[..n]),
        None => -1,
    }
}

fn sys_read(fd: usize, buf: usize, len: usize) -> isize {
    if !valid_user_range(buf, len) {
        return -1;
    }
    let mut entry = match current_fd(fd) {
        Some(e) => e,
        None => return -1,
    };
    let ops = match entry.ops {
        Some(o) => o,
        None => return -1,
    };
    // The op runs with no lock held: terminal and RTC reads block.
    let slice = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len) };
    let n = ops.read(&mut entry, slice);
    store_fd(fd, entry);
    n
}

fn sys_write(fd: usize, buf: usize, len: usize) -> isize {
    if !valid_user_range(buf, len) {
        return -1;
    }
    let mut entry = match current_fd(fd) {
        Some(e) => e,
        None => return -1,
    };
    let ops = match entry.ops {
        Some(o) => o,
        None => return -1,
    };
    let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, len) };
    let n = ops.write(&mut entry, slice);
    store_fd(fd, entry);
    n
}

fn sys_open(name_ptr: usize) -> isize {
    let mut name = [0u8; fs::NAME_LEN + 1];
    let len = match copy_user_cstr(name_ptr, &mut name) {
        Some(n) if n > 0 && n <= fs::NAME_LEN => n,
        _ => return -1,
    };
    let dentry = match fs::fs().dentry_by_name(&name[..len]) {
        Some(d) => d,
        None => return -1,
    };
    let (ops, inode): (&'static dyn crate::task::fd::FileOps, u32) = match dentry.file_type {
        fs::TYPE_RTC => (&rtc::RTC_OPS, 0),
        fs::TYPE_DIR => (&fs::DIR_OPS, 0),
        fs::TYPE_FILE => (&fs::REGULAR_OPS, dentry.inode),
        _ => return -1,
    };

    let pid = task::current_pid();
    if pid < 0 {
        return -1;
    }
    match TASKS
        .lock()
        .get_mut(pid as usize)
        .and_then(|p| p.fds.allocate(ops, inode))
    {
        Some(fd) => fd as isize,
        None => -1,
    }
}

fn sys_close(fd: usize) -> isize {
    let pid = task::current_pid();
    if pid < 0 {
        return -1;
    }
    match TASKS.lock().get_mut(pid as usize) {
        Some(pcb) => match pcb.fds.release(fd) {
            Ok(()) => 0,
            Err(()) => -1,
        },
        None => -1,
    }
}

fn sys_getargs(buf: usize, nbytes: usize) -> isize {
    let pid = task::current_pid();
    if pid < 0 {
        return -1;
    }
    let mut args = [0u8; ARGS_LEN];
    let len = {
        let tasks = TASKS.lock();
        match tasks.get(pid as usize) {
            Some(pcb) => {
                args[..pcb.args_len].copy_from_slice(&pcb.args[..pcb.args_len]);
                pcb.args_len
            }
            None => return -1,
        }
    };
    // no arguments, or they do not fit with the terminator
    if len == 0 || len + 1 > nbytes {
        return -1;
    }
    if !valid_user_range(buf, len + 1) {
        return -1;
    }
    unsafe {
        let dst = core::slice::from_raw_parts_mut(buf as *mut u8, len + 1);
        dst[..len].copy_from_slice(&args[..len]);
        dst[len] = 0;
    }
    0
}

fn sys_vidmap(screen_start: usize) -> isize {
    // the argument is a user pointer cell the kernel writes through
    if !valid_user_range(screen_start, core::mem::size_of::<usize>()) {
        return -1;
    }
    let pid = task::current_pid();
    if pid < 0 {
        return -1;
    }
    let terminal_id = {
        let mut tasks = TASKS.lock();
        match tasks.get_mut(pid as usize) {
            Some(pcb) => {
                pcb.vidmapped = true;
                pcb.terminal_id
            }
            None => return -1,
        }
    };
    if paging::remap(pid as usize, true, terminal_id, terminal::displayed_id()).is_err() {
        return -1;
    }
    unsafe {
        *(screen_start as *mut usize) = USER_VIDEO_VIRT;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_range_checks_cover_the_window_edges() {
        assert!(valid_user_range(USER_IMAGE_VIRT, 1));
        assert!(valid_user_range(USER_IMAGE_VIRT, USER_IMAGE_SIZE));
        assert!(valid_user_range(USER_IMAGE_VIRT + USER_IMAGE_SIZE - 1, 1));

        // below, straddling the end, and overflowing
        assert!(!valid_user_range(USER_IMAGE_VIRT - 1, 1));
        assert!(!valid_user_range(USER_IMAGE_VIRT + USER_IMAGE_SIZE - 1, 2));
        assert!(!valid_user_range(0, 8));
        assert!(!valid_user_range(usize::MAX - 4, 16));
        // a zero-length buffer must still point into the window
        assert!(valid_user_range(USER_IMAGE_VIRT, 0));
        assert!(!valid_user_range(USER_IMAGE_VIRT + USER_IMAGE_SIZE, 0));
    }

    #[test]
    fn unsupported_and_unknown_calls_fail() {
        assert_eq!(dispatch(SYS_SET_HANDLER, 0, 0, 0), -1);
        assert_eq!(dispatch(SYS_SIGRETURN, 0, 0, 0), -1);
        assert_eq!(dispatch(0, 0, 0, 0), -1);
        assert_eq!(dispatch(99, 0, 0, 0), -1);
    }

    #[test]
    fn calls_without_a_running_task_fail() {
        // no current task in the host harness, and a null user pointer
        assert_eq!(dispatch(SYS_READ, 0, 0, 16), -1);
        assert_eq!(dispatch(SYS_WRITE, 2, 0, 16), -1);
        assert_eq!(dispatch(SYS_CLOSE, 2, 0, 0), -1);
        assert_eq!(dispatch(SYS_GETARGS, 0, 16, 0), -1);
        assert_eq!(dispatch(SYS_VIDMAP, 0, 0, 0), -1);
    }
}
