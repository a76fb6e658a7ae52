//! triterm-os: a small protected-mode kernel with three virtual terminals.
//!
//! Each terminal runs its own foreground task; a 100 Hz timer rotates the
//! CPU across them while Alt+F-keys move the display independently. Tasks
//! are launched with an execute/halt pair that parks the parent until the
//! child exits, and talk to the kernel through a Unix-like syscall surface
//! at vector 0x80.
//!
//! The crate builds for the host under `cargo test`, where the pure state
//! machines (line discipline, fd tables, page-table arithmetic, the flat
//! filesystem) run as ordinary unit tests.

#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

pub mod arch;
#[cfg(not(test))]
mod boot;
pub mod drivers;
pub mod fs;
pub mod gdt;
pub mod interrupts;
pub mod mem;
pub mod syscall;
pub mod task;
pub mod terminal;
