//! Task registry: a fixed table of process control blocks.
//!
//! Six slots total across three terminals. A slot's `context` field always
//! holds the kernel stack pointer at which that task resumes: the scheduler
//! stores it when rotating away, and `execute` stores the parent's here while
//! the parent is blocked waiting for the child's halt status.

pub mod exec;
pub mod fd;
pub mod scheduler;

use core::sync::atomic::{AtomicI32, Ordering};

use spin::Mutex;

use crate::task::fd::FdTable;

pub const MAX_TASKS: usize = 6;
pub const ARGS_LEN: usize = 128;

/// Per-task kernel stacks, 8 KiB each, growing down from the 8 MiB line.
pub const KERNEL_STACK_SIZE: u64 = 0x2000;
const KERNEL_STACK_BASE: u64 = 0x80_0000;

pub fn kernel_stack_top(pid: usize) -> u64 {
    KERNEL_STACK_BASE - pid as u64 * KERNEL_STACK_SIZE
}

/// A parked kernel context; `sp` is 0 until the first save.
#[derive(Clone, Copy)]
pub struct SavedContext {
    pub sp: usize,
}

impl SavedContext {
    pub const fn none() -> SavedContext {
        SavedContext { sp: 0 }
    }
}

pub struct Pcb {
    pub pid: usize,
    /// -1 for a terminal's root shell.
    pub parent_pid: i32,
    pub terminal_id: usize,
    pub vidmapped: bool,
    pub active: bool,
    pub context: SavedContext,
    pub fds: FdTable,
    pub args: [u8; ARGS_LEN],
    pub args_len: usize,
}

impl Pcb {
    const fn empty(pid: usize) -> Pcb {
        Pcb {
            pid,
            parent_pid: -1,
            terminal_id: 0,
            vidmapped: false,
            active: false,
            context: SavedContext::none(),
            fds: FdTable::empty(),
            args: [0; ARGS_LEN],
            args_len: 0,
        }
    }
}

pub struct TaskTable {
    slots: [Pcb; MAX_TASKS],
}

impl TaskTable {
    pub const fn new() -> TaskTable {
        let mut slots = [const { Pcb::empty(0) }; MAX_TASKS];
        let mut i = 0;
        while i < MAX_TASKS {
            slots[i].pid = i;
            i += 1;
        }
        TaskTable { slots }
    }

    /// Claim the lowest free slot and reset it to a fresh state. The caller
    /// fills in parent, terminal and fd bindings while holding the lock.
    pub fn allocate(&mut self) -> Option<usize> {
        for pid in 0..MAX_TASKS {
            if !self.slots[pid].active {
                self.slots[pid] = Pcb::empty(pid);
                self.slots[pid].active = true;
                return Some(pid);
            }
        }
        None
    }

    pub fn free(&mut self, pid: usize) {
        if pid < MAX_TASKS {
            self.slots[pid] = Pcb::empty(pid);
        }
    }

    pub fn get(&self, pid: usize) -> Option<&Pcb> {
        self.slots.get(pid).filter(|p| p.active)
    }

    pub fn get_mut(&mut self, pid: usize) -> Option<&mut Pcb> {
        self.slots.get_mut(pid).filter(|p| p.active)
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|p| p.active).count()
    }

    pub fn reset_all(&mut self) {
        for pid in 0..MAX_TASKS {
            self.free(pid);
        }
    }
}

/// Boot-time reset of the registry.
pub fn init() {
    TASKS.lock().reset_all();
    set_current_pid(-1);
}

pub static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable::new());

static CURRENT_PID: AtomicI32 = AtomicI32::new(-1);

pub fn current_pid() -> i32 {
    CURRENT_PID.load(Ordering::SeqCst)
}

pub fn set_current_pid(pid: i32) {
    CURRENT_PID.store(pid, Ordering::SeqCst);
}

/// Re-apply the current task's address space after the displayed terminal
/// changed, so an enabled vidmap window tracks the display.
pub fn remap_current(displayed: usize) {
    let pid = current_pid();
    if pid < 0 {
        return;
    }
    let mapping = {
        let tasks = TASKS.lock();
        tasks
            .get(pid as usize)
            .map(|p| (p.vidmapped, p.terminal_id))
    };
    if let Some((vidmapped, terminal)) = mapping {
        let _ = crate::mem::paging::remap(pid as usize, vidmapped, terminal, displayed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_slots_then_exhaustion() {
        let mut table = TaskTable::new();
        for expect in 0..MAX_TASKS {
            assert_eq!(table.allocate(), Some(expect));
        }
        assert_eq!(table.allocate(), None);
        assert_eq!(table.active_count(), MAX_TASKS);
    }

    #[test]
    fn freed_slot_is_reused_lowest_first() {
        let mut table = TaskTable::new();
        for _ in 0..MAX_TASKS {
            table.allocate();
        }
        table.free(1);
        table.free(4);
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.allocate(), Some(4));
        assert_eq!(table.allocate(), None);
    }

    #[test]
    fn get_filters_inactive_and_out_of_range() {
        let mut table = TaskTable::new();
        assert!(table.get(0).is_none());
        table.allocate();
        assert!(table.get(0).is_some());
        assert!(table.get(MAX_TASKS).is_none());
        table.free(0);
        assert!(table.get(0).is_none());
    }

    #[test]
    fn kernel_stacks_descend_without_overlap() {
        for pid in 0..MAX_TASKS - 1 {
            let top = kernel_stack_top(pid);
            let next = kernel_stack_top(pid + 1);
            assert_eq!(top - next, KERNEL_STACK_SIZE);
        }
        assert_eq!(kernel_stack_top(0), 0x80_0000);
    }
}
