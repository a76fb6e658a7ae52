//! Per-task file descriptor table: eight slots, fds 0 and 1 permanently
//! bound to the task's terminal.

/// Dispatch table for everything a descriptor can point at: terminal ends,
/// the RTC device, directories and regular files. Implementations keep all
/// per-open state inside the [`FdEntry`] so the table itself stays `Copy`.
pub trait FileOps: Sync {
    fn open(&self, _fd: &mut FdEntry) -> isize {
        0
    }
    fn close(&self, _fd: &mut FdEntry) -> isize {
        0
    }
    fn read(&self, fd: &mut FdEntry, buf: &mut [u8]) -> isize;
    fn write(&self, fd: &mut FdEntry, buf: &[u8]) -> isize;
}

pub const FD_COUNT: usize = 8;
pub const FD_STDIN: usize = 0;
pub const FD_STDOUT: usize = 1;

#[derive(Clone, Copy)]
pub struct FdEntry {
    pub ops: Option<&'static dyn FileOps>,
    pub inode: u32,
    /// Byte offset for files, dentry index for directories, virtual-tick
    /// interval for the RTC device.
    pub file_pos: usize,
    pub in_use: bool,
}

impl FdEntry {
    pub const fn empty() -> FdEntry {
        FdEntry {
            ops: None,
            inode: 0,
            file_pos: 0,
            in_use: false,
        }
    }
}

#[derive(Clone, Copy)]
pub struct FdTable {
    entries: [FdEntry; FD_COUNT],
}

impl FdTable {
    pub const fn empty() -> FdTable {
        FdTable {
            entries: [FdEntry::empty(); FD_COUNT],
        }
    }

    /// Table for a fresh task: stdin and stdout bound, the rest free.
    pub fn new_for_task(
        stdin: &'static dyn FileOps,
        stdout: &'static dyn FileOps,
    ) -> FdTable {
        let mut table = FdTable::empty();
        table.entries[FD_STDIN] = FdEntry {
            ops: Some(stdin),
            inode: 0,
            file_pos: 0,
            in_use: true,
        };
        table.entries[FD_STDOUT] = FdEntry {
            ops: Some(stdout),
            inode: 0,
            file_pos: 0,
            in_use: true,
        };
        table
    }

    /// Bind `ops` to the first free slot above stdin/stdout. Runs the ops'
    /// open hook; the slot stays free if the hook rejects the open.
    pub fn allocate(&mut self, ops: &'static dyn FileOps, inode: u32) -> Option<usize> {
        for fd in 2..FD_COUNT {
            if !self.entries[fd].in_use {
                let mut entry = FdEntry {
                    ops: Some(ops),
                    inode,
                    file_pos: 0,
                    in_use: true,
                };
                if ops.open(&mut entry) < 0 {
                    return None;
                }
                self.entries[fd] = entry;
                return Some(fd);
            }
        }
        None
    }

    /// Close `fd` and free the slot. Stdin/stdout cannot be closed.
    pub fn release(&mut self, fd: usize) -> Result<(), ()> {
        if fd < 2 || fd >= FD_COUNT || !self.entries[fd].in_use {
            return Err(());
        }
        let mut entry = self.entries[fd];
        if let Some(ops) = entry.ops {
            ops.close(&mut entry);
        }
        self.entries[fd] = FdEntry::empty();
        Ok(())
    }

    pub fn get(&self, fd: usize) -> Option<&FdEntry> {
        self.entries.get(fd).filter(|e| e.in_use)
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FdEntry> {
        self.entries.get_mut(fd).filter(|e| e.in_use)
    }

    /// Run every close hook; used when a task exits.
    pub fn close_all(&mut self) {
        for fd in 2..FD_COUNT {
            let _ = self.release(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOps;
    impl FileOps for NullOps {
        fn read(&self, _fd: &mut FdEntry, _buf: &mut [u8]) -> isize {
            0
        }
        fn write(&self, _fd: &mut FdEntry, _buf: &[u8]) -> isize {
            -1
        }
    }
    static NULL_OPS: NullOps = NullOps;

    #[test]
    fn six_opens_fill_the_table() {
        let mut table = FdTable::new_for_task(&NULL_OPS, &NULL_OPS);
        let mut fds = [0usize; 6];
        for (i, slot) in fds.iter_mut().enumerate() {
            let fd = table.allocate(&NULL_OPS, 0).expect("slot free");
            assert_eq!(fd, i + 2);
            *slot = fd;
        }
        // seventh open fails, the table is untouched
        assert!(table.allocate(&NULL_OPS, 0).is_none());

        // closing one slot makes exactly that slot reusable
        assert!(table.release(fds[2]).is_ok());
        assert_eq!(table.allocate(&NULL_OPS, 0), Some(fds[2]));
    }

    #[test]
    fn stdin_and_stdout_cannot_be_closed() {
        let mut table = FdTable::new_for_task(&NULL_OPS, &NULL_OPS);
        assert!(table.release(FD_STDIN).is_err());
        assert!(table.release(FD_STDOUT).is_err());
        assert!(table.get(FD_STDIN).is_some());
    }

    #[test]
    fn release_rejects_free_and_out_of_range_fds() {
        let mut table = FdTable::new_for_task(&NULL_OPS, &NULL_OPS);
        assert!(table.release(5).is_err());
        assert!(table.release(FD_COUNT).is_err());
    }

    struct RefusingOps;
    impl FileOps for RefusingOps {
        fn open(&self, _fd: &mut FdEntry) -> isize {
            -1
        }
        fn read(&self, _fd: &mut FdEntry, _buf: &mut [u8]) -> isize {
            0
        }
        fn write(&self, _fd: &mut FdEntry, _buf: &[u8]) -> isize {
            -1
        }
    }
    static REFUSING_OPS: RefusingOps = RefusingOps;

    #[test]
    fn rejected_open_leaves_slot_free() {
        let mut table = FdTable::new_for_task(&NULL_OPS, &NULL_OPS);
        assert!(table.allocate(&REFUSING_OPS, 0).is_none());
        assert_eq!(table.allocate(&NULL_OPS, 0), Some(2));
    }
}
