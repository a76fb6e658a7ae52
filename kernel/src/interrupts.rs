//! Interrupt descriptor table, PIC programming and exception policy.
//!
//! An exception raised while a user task is running tears that task down
//! with the fault status; the same exception with no task running is a
//! kernel bug and panics over the serial port.

#![allow(static_mut_refs)]

use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::drivers::{keyboard, pit, rtc};
use crate::task::{self, exec};

pub const PIC1_OFFSET: u8 = 0x20;
pub const PIC2_OFFSET: u8 = 0x28;

pub const SYSCALL_VECTOR: u8 = 0x80;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// Lock-free serial output for panic paths.
fn serial_byte(b: u8) {
    unsafe {
        let mut status: Port<u8> = Port::new(0x3FD);
        while (status.read() & 0x20) == 0 {}
        let mut port: Port<u8> = Port::new(0x3F8);
        port.write(b);
    }
}

fn serial_str(s: &[u8]) {
    for &b in s {
        serial_byte(b);
    }
}

fn serial_hex(val: u64) {
    const HEX: &[u8] = b"0123456789ABCDEF";
    serial_str(b"0x");
    for i in (0..16).rev() {
        serial_byte(HEX[((val >> (i * 4)) & 0xF) as usize]);
    }
}

/// Unrecoverable fault with no user task to blame. Serial-only, no locks.
fn kernel_panic(exception: &[u8], stack_frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    x86_64::instructions::interrupts::disable();

    serial_str(b"\r\n!!! KERNEL PANIC: ");
    serial_str(exception);
    serial_str(b" !!!\r\n");
    if let Some(code) = error_code {
        serial_str(b"error code: ");
        serial_hex(code);
        serial_str(b"\r\n");
    }
    serial_str(b"rip: ");
    serial_hex(stack_frame.instruction_pointer.as_u64());
    serial_str(b"  rsp: ");
    serial_hex(stack_frame.stack_pointer.as_u64());
    serial_str(b"\r\n");

    loop {
        x86_64::instructions::hlt();
    }
}

/// Exception policy: a running task is halted with the fault status, a
/// taskless fault panics.
fn handle_fault(exception: &[u8], stack_frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    if task::current_pid() >= 0 {
        serial_str(b"exception ");
        serial_str(exception);
        serial_str(b" in task, rip ");
        serial_hex(stack_frame.instruction_pointer.as_u64());
        serial_str(b"\r\n");
        exec::fault_halt();
    }
    kernel_panic(exception, stack_frame, error_code);
}

static mut IDT: InterruptDescriptorTable = InterruptDescriptorTable::new();

pub fn init_idt() {
    unsafe {
        initialize_pics();

        IDT.divide_error.set_handler_fn(divide_error_handler);
        IDT.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        IDT.device_not_available
            .set_handler_fn(device_not_available_handler);
        IDT.double_fault
            .set_handler_fn(double_fault_handler)
            .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        IDT.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        IDT.stack_segment_fault.set_handler_fn(stack_segment_handler);
        IDT.general_protection_fault.set_handler_fn(gpf_handler);
        IDT.page_fault.set_handler_fn(page_fault_handler);
        IDT.x87_floating_point.set_handler_fn(x87_fpu_handler);
        IDT.simd_floating_point.set_handler_fn(simd_handler);

        IDT[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        IDT[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);
        IDT[InterruptIndex::Rtc.as_usize()].set_handler_fn(rtc_interrupt_handler);

        // ring 3 may raise the syscall vector; the gate keeps IF clear
        IDT[SYSCALL_VECTOR as usize]
            .set_handler_addr(VirtAddr::new(crate::syscall::entry_address()))
            .set_privilege_level(PrivilegeLevel::Ring3);

        IDT.load();
    }
}

fn initialize_pics() {
    unsafe {
        let mut wait_port: Port<u8> = Port::new(0x80);
        let mut pic1_cmd: Port<u8> = Port::new(PIC1_CMD);
        let mut pic1_data: Port<u8> = Port::new(PIC1_DATA);
        let mut pic2_cmd: Port<u8> = Port::new(PIC2_CMD);
        let mut pic2_data: Port<u8> = Port::new(PIC2_DATA);

        // ICW1: start initialization
        pic1_cmd.write(0x11);
        wait_port.write(0);
        pic2_cmd.write(0x11);
        wait_port.write(0);

        // ICW2: vector offsets
        pic1_data.write(PIC1_OFFSET);
        wait_port.write(0);
        pic2_data.write(PIC2_OFFSET);
        wait_port.write(0);

        // ICW3: cascading
        pic1_data.write(4); // slave on IRQ2
        wait_port.write(0);
        pic2_data.write(2); // cascade identity
        wait_port.write(0);

        // ICW4: 8086 mode
        pic1_data.write(0x01);
        wait_port.write(0);
        pic2_data.write(0x01);
        wait_port.write(0);

        // Everything masked until each driver asks for its line. The
        // cascade line stays open for the slave.
        pic1_data.write(0b1111_1011);
        pic2_data.write(0b1111_1111);
    }
}

pub fn enable_irq(irq: u8) {
    unsafe {
        let port = if irq < 8 { PIC1_DATA } else { PIC2_DATA };
        let mut data: Port<u8> = Port::new(port);
        let mask = data.read() & !(1 << (irq % 8));
        data.write(mask);
    }
}

pub fn disable_irq(irq: u8) {
    unsafe {
        let port = if irq < 8 { PIC1_DATA } else { PIC2_DATA };
        let mut data: Port<u8> = Port::new(port);
        let mask = data.read() | (1 << (irq % 8));
        data.write(mask);
    }
}

pub fn notify_end_of_interrupt(irq: u8) {
    unsafe {
        if irq >= 8 {
            let mut pic2: Port<u8> = Port::new(PIC2_CMD);
            pic2.write(0x20);
        }
        let mut pic1: Port<u8> = Port::new(PIC1_CMD);
        pic1.write(0x20);
    }
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    handle_fault(b"DIVIDE BY ZERO (#DE)", &stack_frame, None);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    handle_fault(b"INVALID OPCODE (#UD)", &stack_frame, None);
}

extern "x86-interrupt" fn device_not_available_handler(stack_frame: InterruptStackFrame) {
    handle_fault(b"DEVICE NOT AVAILABLE (#NM)", &stack_frame, None);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    kernel_panic(b"DOUBLE FAULT (#DF)", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn segment_not_present_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    handle_fault(b"SEGMENT NOT PRESENT (#NP)", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn stack_segment_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    handle_fault(b"STACK SEGMENT FAULT (#SS)", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn gpf_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    handle_fault(b"GENERAL PROTECTION FAULT (#GP)", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    serial_str(b"page fault at ");
    serial_hex(x86_64::registers::control::Cr2::read_raw());
    serial_str(b"\r\n");
    handle_fault(b"PAGE FAULT (#PF)", &stack_frame, Some(error_code.bits()));
}

extern "x86-interrupt" fn x87_fpu_handler(stack_frame: InterruptStackFrame) {
    handle_fault(b"x87 FPU ERROR (#MF)", &stack_frame, None);
}

extern "x86-interrupt" fn simd_handler(stack_frame: InterruptStackFrame) {
    handle_fault(b"SIMD FLOATING POINT (#XM)", &stack_frame, None);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // EOI first: the tick may switch stacks and not return here for a
    // while, and the PIC must keep ticking for the other terminals.
    notify_end_of_interrupt(InterruptIndex::Timer.as_irq());
    pit::on_tick();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    keyboard::on_interrupt();
    notify_end_of_interrupt(InterruptIndex::Keyboard.as_irq());
}

extern "x86-interrupt" fn rtc_interrupt_handler(_stack_frame: InterruptStackFrame) {
    rtc::on_interrupt();
    notify_end_of_interrupt(InterruptIndex::Rtc.as_irq());
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC1_OFFSET,
    Keyboard,
    Rtc = PIC2_OFFSET,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }

    pub fn as_irq(self) -> u8 {
        self.as_u8() - PIC1_OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_indices_map_to_their_irq_lines() {
        assert_eq!(InterruptIndex::Timer.as_irq(), 0);
        assert_eq!(InterruptIndex::Keyboard.as_irq(), 1);
        assert_eq!(InterruptIndex::Rtc.as_irq(), 8);
    }
}
