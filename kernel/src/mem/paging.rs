//! Static long-mode page tables for the low 1 GiB plus the per-task user
//! window.
//!
//! There is no frame allocator: every table is a static array and every
//! mapping is fixed at compile time except two, which [`PageTables::map_task`]
//! rewrites on each task or display switch. The user image window at
//! `0x0800_0000` follows the running task's private frame, and the vidmap
//! window follows the display state of the task's terminal.

use bitflags::bitflags;
use spin::Mutex;

use crate::drivers::vga::VGA_FRAME_ADDR;
use crate::task::MAX_TASKS;
use crate::terminal::{backing_page_addr, TERMINAL_COUNT};

pub const PAGE_4K: u64 = 0x1000;
pub const PAGE_2M: u64 = 0x20_0000;
const ENTRY_COUNT: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Base of the 4 MiB user image window in every task's address space.
pub const USER_IMAGE_VIRT: usize = 0x0800_0000;
pub const USER_IMAGE_SIZE: usize = 0x40_0000;
/// Where program images are loaded inside the window.
pub const IMAGE_LOAD_VIRT: usize = 0x0804_8000;
/// The user-visible video page handed out by the vidmap syscall.
pub const USER_VIDEO_VIRT: usize = 0x0840_0000 + VGA_FRAME_ADDR;

/// Physical base of task frames; task `pid` owns the 4 MiB at
/// `0x800000 + pid * 4MiB`, reached through the identity mapping.
const TASK_FRAME_BASE: u64 = 0x80_0000;

const USER_IMAGE_PD_INDEX: usize = USER_IMAGE_VIRT / PAGE_2M as usize; // 64
const VIDMAP_PD_INDEX: usize = USER_VIDEO_VIRT / PAGE_2M as usize; // 66
const VIDMAP_PT_INDEX: usize = (USER_VIDEO_VIRT >> 12) & (ENTRY_COUNT - 1); // 184

/// Identity-mapped span; covers the kernel image and all six task frames.
const IDENTITY_END: u64 = 0x200_0000;

pub fn user_frame_addr(pid: usize) -> u64 {
    TASK_FRAME_BASE + pid as u64 * USER_IMAGE_SIZE as u64
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

#[repr(C, align(4096))]
pub struct Table {
    entries: [u64; ENTRY_COUNT],
}

impl Table {
    const fn empty() -> Table {
        Table {
            entries: [0; ENTRY_COUNT],
        }
    }

    fn set(&mut self, index: usize, addr: u64, flags: EntryFlags) {
        self.entries[index] = (addr & ADDR_MASK) | flags.bits();
    }

    fn clear(&mut self, index: usize) {
        self.entries[index] = 0;
    }

    pub fn entry(&self, index: usize) -> u64 {
        self.entries[index]
    }
}

pub fn entry_addr(entry: u64) -> u64 {
    entry & ADDR_MASK
}

pub fn entry_flags(entry: u64) -> EntryFlags {
    EntryFlags::from_bits_truncate(entry)
}

pub struct PageTables {
    pml4: Table,
    pdpt: Table,
    /// 2 MiB entries for the low 1 GiB, including both user window slots.
    pd: Table,
    /// 4 KiB granularity for the first 2 MiB; page 0 stays absent so null
    /// derefs fault instead of scribbling on the IVT area.
    low_pt: Table,
    vidmap_pt: Table,
}

impl PageTables {
    pub const fn new() -> PageTables {
        PageTables {
            pml4: Table::empty(),
            pdpt: Table::empty(),
            pd: Table::empty(),
            low_pt: Table::empty(),
            vidmap_pt: Table::empty(),
        }
    }

    /// Build the fixed kernel mappings. Must run before `activate`.
    pub fn init(&mut self) {
        let walk = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER;
        let kernel = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::GLOBAL;

        let pdpt_addr = core::ptr::addr_of!(self.pdpt) as u64;
        let pd_addr = core::ptr::addr_of!(self.pd) as u64;
        let low_pt_addr = core::ptr::addr_of!(self.low_pt) as u64;

        self.pml4.set(0, pdpt_addr, walk);
        self.pdpt.set(0, pd_addr, walk);
        self.pd
            .set(0, low_pt_addr, EntryFlags::PRESENT | EntryFlags::WRITABLE);

        for i in 1..ENTRY_COUNT {
            self.low_pt.set(i, i as u64 * PAGE_4K, kernel);
        }
        for i in 1..(IDENTITY_END / PAGE_2M) as usize {
            self.pd
                .set(i, i as u64 * PAGE_2M, kernel | EntryFlags::HUGE);
        }
    }

    /// Point the user windows at task `pid`. The vidmap page targets the
    /// live frame only while the owning terminal is the displayed one;
    /// otherwise the task draws into its terminal's backing page.
    pub fn map_task(
        &mut self,
        pid: usize,
        vidmapped: bool,
        owning_terminal: usize,
        terminal_displayed: usize,
    ) -> Result<(), &'static str> {
        if pid >= MAX_TASKS {
            return Err("map_task: pid out of range");
        }
        if owning_terminal >= TERMINAL_COUNT || terminal_displayed >= TERMINAL_COUNT {
            return Err("map_task: terminal out of range");
        }

        let user = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER;
        let frame = user_frame_addr(pid);
        self.pd
            .set(USER_IMAGE_PD_INDEX, frame, user | EntryFlags::HUGE);
        self.pd
            .set(USER_IMAGE_PD_INDEX + 1, frame + PAGE_2M, user | EntryFlags::HUGE);

        if vidmapped {
            let vidmap_pt_addr = core::ptr::addr_of!(self.vidmap_pt) as u64;
            let target = if owning_terminal == terminal_displayed {
                VGA_FRAME_ADDR as u64
            } else {
                backing_page_addr(owning_terminal) as u64
            };
            self.pd.set(VIDMAP_PD_INDEX, vidmap_pt_addr, user);
            self.vidmap_pt.set(VIDMAP_PT_INDEX, target, user);
        } else {
            self.unmap_vidmap();
        }
        Ok(())
    }

    pub fn unmap_vidmap(&mut self) {
        self.pd.clear(VIDMAP_PD_INDEX);
        self.vidmap_pt.clear(VIDMAP_PT_INDEX);
    }

    pub fn pml4_addr(&self) -> u64 {
        core::ptr::addr_of!(self.pml4) as u64
    }

    pub fn image_entry(&self, slot: usize) -> u64 {
        self.pd.entry(USER_IMAGE_PD_INDEX + slot)
    }

    pub fn vidmap_leaf(&self) -> u64 {
        self.vidmap_pt.entry(VIDMAP_PT_INDEX)
    }

    pub fn vidmap_present(&self) -> bool {
        entry_flags(self.pd.entry(VIDMAP_PD_INDEX)).contains(EntryFlags::PRESENT)
    }
}

pub static PAGING: Mutex<PageTables> = Mutex::new(PageTables::new());

/// Rewrite the user windows and flush the TLB. The single mapping entry
/// point used by exec, halt, the scheduler and display switches.
pub fn remap(
    pid: usize,
    vidmapped: bool,
    owning_terminal: usize,
    terminal_displayed: usize,
) -> Result<(), &'static str> {
    PAGING
        .lock()
        .map_task(pid, vidmapped, owning_terminal, terminal_displayed)?;
    flush_tlb();
    Ok(())
}

/// Build the kernel mappings and load CR3.
#[cfg(not(test))]
pub fn init() {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    let pml4 = {
        let mut tables = PAGING.lock();
        tables.init();
        tables.pml4_addr()
    };
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(pml4)),
            Cr3Flags::empty(),
        );
    }
}

#[cfg(not(test))]
pub fn flush_tlb() {
    x86_64::instructions::tlb::flush_all();
}

#[cfg(test)]
pub fn flush_tlb() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_window_follows_pid() {
        let mut pt = PageTables::new();
        pt.map_task(2, false, 0, 0).unwrap();

        let lo = pt.image_entry(0);
        let hi = pt.image_entry(1);
        assert_eq!(entry_addr(lo), 0x80_0000 + 2 * 0x40_0000);
        assert_eq!(entry_addr(hi), entry_addr(lo) + PAGE_2M);
        for e in [lo, hi] {
            let f = entry_flags(e);
            assert!(f.contains(EntryFlags::PRESENT | EntryFlags::USER | EntryFlags::HUGE));
        }
        assert!(!pt.vidmap_present());
    }

    #[test]
    fn vidmap_targets_live_frame_only_when_displayed() {
        let mut pt = PageTables::new();

        // owning terminal 1 is displayed: user video page is the real frame
        pt.map_task(0, true, 1, 1).unwrap();
        assert!(pt.vidmap_present());
        assert_eq!(entry_addr(pt.vidmap_leaf()), VGA_FRAME_ADDR as u64);

        // display moves to terminal 2: same task now draws off screen
        pt.map_task(0, true, 1, 2).unwrap();
        assert_eq!(entry_addr(pt.vidmap_leaf()), backing_page_addr(1) as u64);
        assert!(entry_flags(pt.vidmap_leaf()).contains(EntryFlags::USER));
    }

    #[test]
    fn remap_without_vidmap_clears_the_window() {
        let mut pt = PageTables::new();
        pt.map_task(0, true, 0, 0).unwrap();
        assert!(pt.vidmap_present());
        pt.map_task(0, false, 0, 0).unwrap();
        assert!(!pt.vidmap_present());
        assert_eq!(pt.vidmap_leaf(), 0);
    }

    #[test]
    fn map_task_rejects_out_of_range_ids() {
        let mut pt = PageTables::new();
        assert!(pt.map_task(MAX_TASKS, false, 0, 0).is_err());
        assert!(pt.map_task(0, true, TERMINAL_COUNT, 0).is_err());
        assert!(pt.map_task(0, true, 0, TERMINAL_COUNT).is_err());
        // failed calls leave the image window untouched
        assert_eq!(pt.image_entry(0), 0);
    }

    #[test]
    fn kernel_mappings_leave_page_zero_absent() {
        let mut pt = PageTables::new();
        pt.init();
        assert_eq!(pt.low_pt.entry(0), 0);
        let vga = pt.low_pt.entry((VGA_FRAME_ADDR / PAGE_4K as usize) & 511);
        assert!(entry_flags(vga).contains(EntryFlags::PRESENT | EntryFlags::WRITABLE));
        assert!(!entry_flags(vga).contains(EntryFlags::USER));
    }
}
