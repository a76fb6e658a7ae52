//! Round-robin rotation of the CPU across the three terminals.
//!
//! Every timer tick moves execution to the next terminal's foreground task.
//! A terminal that has no task yet gets a shell synthesized for it on the
//! spot: the outgoing context is parked first, so the bootstrap frames live
//! below it on the outgoing stack and are dead by the time that task can
//! run again.

use crate::arch::x86_64 as arch;
use crate::gdt;
use crate::mem::paging;
use crate::task::{self, exec, TASKS};
use crate::terminal::{self, TERMINALS};

pub fn next_terminal(current: usize) -> usize {
    (current + 1) % terminal::TERMINAL_COUNT
}

/// Timer interrupt entry. The handler has already acknowledged the IRQ;
/// interrupts stay disabled until the resumed task's iretq.
pub fn on_timer_tick() {
    let current = terminal::executing_id();
    switch_executing(next_terminal(current));
}

/// Move execution to `new_id`'s foreground task. Updates the executing id,
/// hands the writer over, then performs the stack switch with every lock
/// released.
pub fn switch_executing(new_id: usize) {
    let mut terms = TERMINALS.lock();
    let old_id = match terms.set_executing(new_id) {
        Some(old) => old,
        None => return,
    };
    let incoming_fg = terms.terminal(new_id).foreground_pid;
    drop(terms);

    terminal::writer_follow_executing(old_id, new_id);

    let outgoing_pid = task::current_pid();
    let save_sp: *mut usize = if outgoing_pid >= 0 {
        let mut tasks = TASKS.lock();
        match tasks.get_mut(outgoing_pid as usize) {
            Some(pcb) => &mut pcb.context.sp as *mut usize,
            None => core::ptr::null_mut(),
        }
    } else {
        core::ptr::null_mut()
    };

    if incoming_fg < 0 {
        // First visit to this terminal: park the outgoing task and start a
        // root shell for it.
        if save_sp.is_null() {
            return;
        }
        task::set_current_pid(-1);
        unsafe {
            arch::save_and_call(save_sp, exec::shell_bootstrap, new_id);
        }
        // Resumed on a later rotation back to old_id.
        return;
    }

    let incoming = incoming_fg as usize;
    let resume = {
        let tasks = TASKS.lock();
        tasks
            .get(incoming)
            .map(|p| (p.context.sp, p.vidmapped, p.terminal_id))
    };
    let (resume_sp, vidmapped, owning_terminal) = match resume {
        Some(r) if r.0 != 0 => r,
        _ => return,
    };

    gdt::set_kernel_stack(task::kernel_stack_top(incoming));
    let _ = paging::remap(incoming, vidmapped, owning_terminal, terminal::displayed_id());
    task::set_current_pid(incoming_fg);
    unsafe {
        arch::switch_stacks(save_sp, resume_sp);
    }
    // Running again: the rotation came back around to this task.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::TERMINAL_COUNT;

    #[test]
    fn rotation_visits_every_terminal_in_order() {
        let mut id = 0;
        let mut seen = Vec::new();
        for _ in 0..TERMINAL_COUNT * 2 {
            id = next_terminal(id);
            seen.push(id);
        }
        assert_eq!(seen, vec![1, 2, 0, 1, 2, 0]);
    }
}
