//! Global Descriptor Table and TSS setup.
//!
//! Segment layout is fixed and mirrored by the selector constants in
//! `arch::x86_64`: kernel code, kernel data, user data, user code, TSS.
//! The TSS privilege stack is re-pointed at every task switch so ring 3 ->
//! ring 0 transitions land on the current task's kernel stack.

#![allow(static_mut_refs)]

use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// Stack for the double fault handler, separate from any task stack.
const BOOT_STACK_SIZE: usize = 4096 * 4;

#[repr(C, align(4096))]
struct Stack {
    data: [u8; BOOT_STACK_SIZE],
}

static DOUBLE_FAULT_STACK: Stack = Stack { data: [0; BOOT_STACK_SIZE] };

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

static mut TSS: TaskStateSegment = TaskStateSegment::new();
static mut GDT: GlobalDescriptorTable = GlobalDescriptorTable::new();

/// Point the TSS privilege stack at `stack_top`. Called on every task
/// creation and task switch; the next interrupt or syscall from ring 3
/// enters the kernel on that stack.
pub fn set_kernel_stack(stack_top: u64) {
    unsafe {
        TSS.privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Build and load the GDT and TSS. The descriptor order here is load-bearing:
/// the context-switch assembly hardcodes the resulting selector values.
pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::instructions::tables::load_tss;

    unsafe {
        let ist_top = VirtAddr::from_ptr(&DOUBLE_FAULT_STACK) + BOOT_STACK_SIZE as u64;
        TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = ist_top;

        let kernel_code = GDT.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = GDT.add_entry(Descriptor::kernel_data_segment());
        GDT.add_entry(Descriptor::user_data_segment());
        GDT.add_entry(Descriptor::user_code_segment());
        let tss = GDT.add_entry(Descriptor::tss_segment(&TSS));

        GDT.load();
        CS::set_reg(kernel_code);
        SS::set_reg(kernel_data);
        DS::set_reg(kernel_data);
        ES::set_reg(kernel_data);
        load_tss(tss);
    }
}
