//! Low-level context switch and privilege transition primitives.
//!
//! Everything that manipulates raw stack frames lives here so the task and
//! scheduler code above it stays portable. Three rules hold these routines
//! together:
//!
//! 1. A saved context is a stack pointer that points at a block of six
//!    pushed callee-saved registers (rbp, rbx, r12, r13, r14, r15) with the
//!    caller's return address directly above it.
//! 2. Every routine that produces such a context pushes the registers in the
//!    same order, and every routine that consumes one pops them in reverse.
//! 3. Resuming a context is always `mov rsp` + pops + `ret`; no routine here
//!    returns normally after switching stacks.

use core::arch::global_asm;

// Segment selectors as laid out by gdt::init(): kernel code 0x08, kernel
// data 0x10, user data 0x18 | RPL 3, user code 0x20 | RPL 3.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_DATA_SELECTOR: u16 = 0x1B;
pub const USER_CODE_SELECTOR: u16 = 0x23;

// RFLAGS image for user entry: IF plus the always-one bit.
const USER_RFLAGS: u64 = 0x202;

global_asm!(
    "
    .global __triterm_switch_stacks
    .global __triterm_save_and_call
    .global __triterm_user_launch
    .global __triterm_halt_return

// fn(save_sp: *mut usize, new_sp: usize)
// Saves the current kernel context into *save_sp (unless null) and resumes
// the context at new_sp. Returns only when this context is resumed again.
__triterm_switch_stacks:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    test rdi, rdi
    jz 2f
    mov [rdi], rsp
2:  mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

// fn(save_sp: *mut usize, f: extern fn(usize) -> !, arg: usize)
// Saves the current context like switch_stacks, then calls f(arg) on the
// same stack. f must never return; control comes back here only when the
// saved context is resumed through switch_stacks or halt_return.
__triterm_save_and_call:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rdi, rdx
    call rsi
    ud2

// fn(save_sp: *mut usize, entry: usize, user_sp: usize) -> isize
// Saves the caller's context (the parent blocked in execute()), then builds
// an iretq frame and drops to ring 3 at entry. The isize return value is
// delivered later by __triterm_halt_return when the child halts.
__triterm_user_launch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov ax, {user_data}
    mov ds, ax
    mov es, ax
    push {user_data}        // ss
    push rdx                // user stack pointer
    push {user_rflags}      // rflags with IF set
    push {user_code}        // cs
    push rsi                // entry point
    iretq

// fn(resume_sp: usize, status: isize) -> !
// Resumes a context saved by __triterm_user_launch, making the suspended
// execute() call return `status`.
__triterm_halt_return:
    mov rsp, rdi
    mov rax, rsi
    mov cx, {kernel_data}
    mov ds, cx
    mov es, cx
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
",
    user_data = const USER_DATA_SELECTOR as u64,
    user_code = const USER_CODE_SELECTOR as u64,
    kernel_data = const KERNEL_DATA_SELECTOR as u64,
    user_rflags = const USER_RFLAGS,
);

extern "sysv64" {
    fn __triterm_switch_stacks(save_sp: *mut usize, new_sp: usize);
    fn __triterm_save_and_call(save_sp: *mut usize, f: extern "sysv64" fn(usize) -> !, arg: usize);
    fn __triterm_user_launch(save_sp: *mut usize, entry: usize, user_sp: usize) -> isize;
    fn __triterm_halt_return(resume_sp: usize, status: isize) -> !;
}

/// Switch kernel stacks: save the running context (if `save_sp` is non-null)
/// and resume the one stored at `new_sp`.
///
/// # Safety
/// `new_sp` must have been produced by one of the save primitives in this
/// module and not resumed since. Interrupts must be disabled.
pub unsafe fn switch_stacks(save_sp: *mut usize, new_sp: usize) {
    __triterm_switch_stacks(save_sp, new_sp);
}

/// Save the running context into `save_sp`, then call `f(arg)` which must
/// not return. Used when the scheduler parks a task to synthesize a fresh
/// shell launch for a terminal that has none.
///
/// # Safety
/// Interrupts must be disabled; `save_sp` must point at a live PCB slot.
pub unsafe fn save_and_call(save_sp: *mut usize, f: extern "sysv64" fn(usize) -> !, arg: usize) {
    __triterm_save_and_call(save_sp, f, arg);
}

/// Perform the privilege transition into user mode. Suspends the calling
/// kernel context; the value returned is the halt status of the launched
/// task, delivered via [`halt_return`].
///
/// # Safety
/// The user address space for the new task must already be mapped and the
/// TSS kernel stack updated. Interrupts must be disabled.
pub unsafe fn user_launch(save_sp: *mut usize, entry: usize, user_sp: usize) -> isize {
    __triterm_user_launch(save_sp, entry, user_sp)
}

/// Resume a context suspended by [`user_launch`], delivering `status` as the
/// return value of the corresponding execute() call.
///
/// # Safety
/// `resume_sp` must be the untouched value stored by [`user_launch`].
pub unsafe fn halt_return(resume_sp: usize, status: isize) -> ! {
    __triterm_halt_return(resume_sp, status)
}

/// Park the CPU until the next interrupt.
pub fn halt_until_interrupt() {
    x86_64::instructions::hlt();
}
