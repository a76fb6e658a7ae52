//! Read-only flat filesystem over an in-memory image.
//!
//! Layout: one 4 KiB boot block (counts + up to 63 directory entries),
//! then the inode blocks, then the data blocks. Names are at most 32 bytes
//! and only NUL-terminated when shorter than that.

use spin::Once;

use crate::task::fd::{FdEntry, FileOps};

pub const BLOCK_SIZE: usize = 4096;
pub const NAME_LEN: usize = 32;
pub const MAX_DENTRIES: usize = 63;
const DENTRY_SIZE: usize = 64;
const DENTRY_TABLE_OFFSET: usize = 64;
const INODE_BLOCK_PTRS: usize = 1023;

pub const TYPE_RTC: u32 = 0;
pub const TYPE_DIR: u32 = 1;
pub const TYPE_FILE: u32 = 2;

#[derive(Clone, Copy)]
pub struct Dentry {
    pub name: [u8; NAME_LEN],
    pub file_type: u32,
    pub inode: u32,
}

impl Dentry {
    /// The name without trailing NUL padding. A full 32-byte name has none.
    pub fn name(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &self.name[..end]
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub struct FileSystem {
    image: &'static [u8],
    dentry_count: usize,
    inode_count: usize,
    data_block_count: usize,
}

impl FileSystem {
    pub fn new(image: &'static [u8]) -> Result<FileSystem, &'static str> {
        if image.len() < BLOCK_SIZE {
            return Err("fs: image smaller than the boot block");
        }
        let dentry_count = read_u32(image, 0) as usize;
        let inode_count = read_u32(image, 4) as usize;
        let data_block_count = read_u32(image, 8) as usize;
        if dentry_count > MAX_DENTRIES {
            return Err("fs: boot block dentry count out of range");
        }
        let needed = (1 + inode_count + data_block_count) * BLOCK_SIZE;
        if image.len() < needed {
            return Err("fs: image truncated");
        }
        Ok(FileSystem {
            image,
            dentry_count,
            inode_count,
            data_block_count,
        })
    }

    pub fn dentry_count(&self) -> usize {
        self.dentry_count
    }

    pub fn dentry_by_index(&self, index: usize) -> Option<Dentry> {
        if index >= self.dentry_count {
            return None;
        }
        let base = DENTRY_TABLE_OFFSET + index * DENTRY_SIZE;
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&self.image[base..base + NAME_LEN]);
        Some(Dentry {
            name,
            file_type: read_u32(self.image, base + NAME_LEN),
            inode: read_u32(self.image, base + NAME_LEN + 4),
        })
    }

    /// Look a file up by name. `name` longer than 32 bytes never matches.
    pub fn dentry_by_name(&self, name: &[u8]) -> Option<Dentry> {
        if name.is_empty() || name.len() > NAME_LEN {
            return None;
        }
        (0..self.dentry_count)
            .filter_map(|i| self.dentry_by_index(i))
            .find(|d| d.name() == name)
    }

    fn inode_block(&self, inode: u32) -> Result<&[u8], &'static str> {
        if inode as usize >= self.inode_count {
            return Err("fs: inode out of range");
        }
        let base = (1 + inode as usize) * BLOCK_SIZE;
        Ok(&self.image[base..base + BLOCK_SIZE])
    }

    pub fn inode_len(&self, inode: u32) -> Result<usize, &'static str> {
        Ok(read_u32(self.inode_block(inode)?, 0) as usize)
    }

    /// Copy up to `buf.len()` bytes of the file starting at byte `offset`.
    /// Returns the number copied; 0 at or past end of file. A block number
    /// outside the image is a corrupt filesystem, not end of file.
    pub fn read_data(
        &self,
        inode: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, &'static str> {
        let inode_block = self.inode_block(inode)?;
        let length = read_u32(inode_block, 0) as usize;
        if offset >= length {
            return Ok(0);
        }

        let mut copied = 0;
        let want = buf.len().min(length - offset);
        while copied < want {
            let pos = offset + copied;
            let block_index = pos / BLOCK_SIZE;
            if block_index >= INODE_BLOCK_PTRS {
                return Err("fs: file too long for its inode");
            }
            let block_num = read_u32(inode_block, 4 + block_index * 4) as usize;
            if block_num >= self.data_block_count {
                return Err("fs: data block out of range");
            }
            let block_base = (1 + self.inode_count + block_num) * BLOCK_SIZE;
            let in_block = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - in_block).min(want - copied);
            buf[copied..copied + chunk]
                .copy_from_slice(&self.image[block_base + in_block..block_base + in_block + chunk]);
            copied += chunk;
        }
        Ok(copied)
    }
}

static FS: Once<FileSystem> = Once::new();

pub fn init(image: &'static [u8]) -> Result<(), &'static str> {
    let fs = FileSystem::new(image)?;
    FS.call_once(|| fs);
    Ok(())
}

pub fn fs() -> &'static FileSystem {
    FS.get().expect("fs::init not called")
}

/// Regular files: sequential reads advancing the descriptor offset.
pub struct RegularOps;

impl FileOps for RegularOps {
    fn read(&self, fd: &mut FdEntry, buf: &mut [u8]) -> isize {
        match fs().read_data(fd.inode, fd.file_pos, buf) {
            Ok(n) => {
                fd.file_pos += n;
                n as isize
            }
            Err(_) => -1,
        }
    }

    fn write(&self, _fd: &mut FdEntry, _buf: &[u8]) -> isize {
        -1
    }
}

/// The directory: each read returns one entry name, then 0 at the end.
pub struct DirOps;

impl FileOps for DirOps {
    fn read(&self, fd: &mut FdEntry, buf: &mut [u8]) -> isize {
        match fs().dentry_by_index(fd.file_pos) {
            Some(dentry) => {
                fd.file_pos += 1;
                let name = dentry.name();
                let n = name.len().min(buf.len());
                buf[..n].copy_from_slice(&name[..n]);
                n as isize
            }
            None => 0,
        }
    }

    fn write(&self, _fd: &mut FdEntry, _buf: &[u8]) -> isize {
        -1
    }
}

pub static REGULAR_OPS: RegularOps = RegularOps;
pub static DIR_OPS: DirOps = DirOps;

#[cfg(test)]
mod tests {
    use super::*;

    struct ImageBuilder {
        dentries: Vec<(Vec<u8>, u32, u32)>,
        files: Vec<Vec<u8>>,
    }

    impl ImageBuilder {
        fn new() -> ImageBuilder {
            ImageBuilder {
                dentries: vec![(b".".to_vec(), TYPE_DIR, 0)],
                files: Vec::new(),
            }
        }

        fn file(mut self, name: &[u8], data: &[u8]) -> ImageBuilder {
            let inode = self.files.len() as u32;
            self.dentries.push((name.to_vec(), TYPE_FILE, inode));
            self.files.push(data.to_vec());
            self
        }

        fn build(self) -> &'static [u8] {
            let inode_count = self.files.len();
            let mut blocks_per_file = Vec::new();
            let mut data_block_count = 0;
            for f in &self.files {
                let n = f.len().div_ceil(BLOCK_SIZE);
                blocks_per_file.push(n);
                data_block_count += n;
            }

            let total = (1 + inode_count + data_block_count) * BLOCK_SIZE;
            let mut image = vec![0u8; total];
            image[0..4].copy_from_slice(&(self.dentries.len() as u32).to_le_bytes());
            image[4..8].copy_from_slice(&(inode_count as u32).to_le_bytes());
            image[8..12].copy_from_slice(&(data_block_count as u32).to_le_bytes());

            for (i, (name, ftype, inode)) in self.dentries.iter().enumerate() {
                let base = DENTRY_TABLE_OFFSET + i * DENTRY_SIZE;
                image[base..base + name.len()].copy_from_slice(name);
                image[base + 32..base + 36].copy_from_slice(&ftype.to_le_bytes());
                image[base + 36..base + 40].copy_from_slice(&inode.to_le_bytes());
            }

            let mut next_block = 0u32;
            for (inode, f) in self.files.iter().enumerate() {
                let base = (1 + inode) * BLOCK_SIZE;
                image[base..base + 4].copy_from_slice(&(f.len() as u32).to_le_bytes());
                for b in 0..blocks_per_file[inode] {
                    let off = base + 4 + b * 4;
                    image[off..off + 4].copy_from_slice(&next_block.to_le_bytes());
                    let dst = (1 + inode_count + next_block as usize) * BLOCK_SIZE;
                    let src = &f[b * BLOCK_SIZE..f.len().min((b + 1) * BLOCK_SIZE)];
                    image[dst..dst + src.len()].copy_from_slice(src);
                    next_block += 1;
                }
            }
            Box::leak(image.into_boxed_slice())
        }
    }

    #[test]
    fn lookup_by_name_is_exact() {
        let fs = FileSystem::new(
            ImageBuilder::new()
                .file(b"frame0.txt", b"fish")
                .file(b"frame1.txt", b"cat")
                .build(),
        )
        .unwrap();
        assert_eq!(fs.dentry_by_name(b"frame1.txt").unwrap().inode, 1);
        assert!(fs.dentry_by_name(b"frame1").is_none());
        assert!(fs.dentry_by_name(b"").is_none());
    }

    #[test]
    fn full_length_names_have_no_terminator() {
        let name = [b'x'; NAME_LEN];
        let fs = FileSystem::new(ImageBuilder::new().file(&name, b"data").build()).unwrap();
        let d = fs.dentry_by_name(&name).unwrap();
        assert_eq!(d.name().len(), NAME_LEN);
        // a 33-byte query can never match
        let mut long = [b'x'; NAME_LEN + 1];
        long[NAME_LEN] = b'x';
        assert!(fs.dentry_by_name(&long).is_none());
    }

    #[test]
    fn read_data_spans_block_boundaries() {
        let mut data = vec![0u8; BLOCK_SIZE + 100];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let fs = FileSystem::new(ImageBuilder::new().file(b"big", &data).build()).unwrap();
        let d = fs.dentry_by_name(b"big").unwrap();

        // a read straddling the first block boundary
        let mut buf = [0u8; 64];
        let n = fs.read_data(d.inode, BLOCK_SIZE - 32, &mut buf).unwrap();
        assert_eq!(n, 64);
        assert_eq!(&buf[..], &data[BLOCK_SIZE - 32..BLOCK_SIZE + 32]);

        // reads past the end are truncated, then empty
        let n = fs.read_data(d.inode, data.len() - 10, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(fs.read_data(d.inode, data.len(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn bad_inode_and_bad_block_are_errors() {
        let image = ImageBuilder::new().file(b"a", b"hello").build();
        let fs = FileSystem::new(image).unwrap();
        let mut buf = [0u8; 8];
        assert!(fs.read_data(99, 0, &mut buf).is_err());

        // corrupt the file's first block pointer
        let mut bad = image.to_vec();
        let ptr_off = BLOCK_SIZE + 4;
        bad[ptr_off..ptr_off + 4].copy_from_slice(&1000u32.to_le_bytes());
        let fs = FileSystem::new(Box::leak(bad.into_boxed_slice())).unwrap();
        assert!(fs.read_data(0, 0, &mut buf).is_err());
    }

    #[test]
    fn directory_reads_enumerate_names_once() {
        let fs_image = ImageBuilder::new().file(b"one", b"1").file(b"two", b"2").build();
        init(fs_image).unwrap();

        let mut fd = FdEntry::empty();
        fd.in_use = true;
        let mut buf = [0u8; NAME_LEN];
        let mut seen = Vec::new();
        loop {
            let n = DIR_OPS.read(&mut fd, &mut buf);
            if n == 0 {
                break;
            }
            seen.push(buf[..n as usize].to_vec());
        }
        assert_eq!(seen, vec![b".".to_vec(), b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(DIR_OPS.read(&mut fd, &mut buf), 0);
    }
}
