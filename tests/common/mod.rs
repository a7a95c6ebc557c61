//! Test harness: a kernel booted on a RAM disk plus one process, with
//! helpers that drive the syscall surface the way a trap handler would —
//! arguments in the frame, strings and buffers in user memory.

use std::sync::Arc;

use kvfs::fs::xv6fs::{self, Superblock, BPB};
use kvfs::fs::Stat;
use kvfs::hal::MemDisk;
use kvfs::kernel::{boot, Kernel};
use kvfs::proc::Proc;
use kvfs::syscall::{into_ret, KernelCtx};
use zerocopy::FromBytes;

/// User-memory layout the helpers use.
pub const PATH0: usize = 0x100;
pub const PATH1: usize = 0x300;
pub const STAT: usize = 0x500;
pub const FDS: usize = 0x600;
pub const BUF: usize = 0x1000;

pub const UMEM: usize = 1 << 16;

pub struct Harness {
    pub kernel: &'static Kernel,
    pub disk: Arc<MemDisk>,
    pub proc: Proc,
}

pub fn setup() -> Harness {
    setup_with(2000, 200)
}

pub fn setup_with(nblocks: u32, ninodes: u32) -> Harness {
    let disk = Arc::new(MemDisk::new(nblocks));
    xv6fs::mkfs(&*disk, ninodes);
    let kernel = boot(Box::new(disk.clone())).expect("boot");
    let proc = Proc::new(kernel, UMEM);
    Harness { kernel, disk, proc }
}

#[allow(dead_code)]
impl Harness {
    pub fn ctx(&mut self) -> KernelCtx<'_> {
        KernelCtx::new(self.kernel, &mut self.proc)
    }

    pub fn put_str(&mut self, addr: usize, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.proc.mem.copy_out(addr, &bytes).expect("put_str");
    }

    pub fn open(&mut self, path: &str, flags: i32) -> i64 {
        self.put_str(PATH0, path);
        self.proc.frame = [PATH0, flags as usize, 0, 0, 0, 0];
        into_ret(self.ctx().sys_open())
    }

    pub fn close(&mut self, fd: i64) -> i64 {
        self.proc.frame = [fd as usize, 0, 0, 0, 0, 0];
        into_ret(self.ctx().sys_close())
    }

    pub fn write(&mut self, fd: i64, data: &[u8]) -> i64 {
        self.proc.mem.copy_out(BUF, data).expect("write data");
        self.proc.frame = [fd as usize, BUF, data.len(), 0, 0, 0];
        into_ret(self.ctx().sys_write())
    }

    pub fn read(&mut self, fd: i64, n: usize) -> (i64, Vec<u8>) {
        self.proc.frame = [fd as usize, BUF, n, 0, 0, 0];
        let r = into_ret(self.ctx().sys_read());
        let mut data = vec![0u8; if r > 0 { r as usize } else { 0 }];
        if r > 0 {
            self.proc.mem.copy_in(&mut data, BUF).expect("read data");
        }
        (r, data)
    }

    pub fn fstat(&mut self, fd: i64) -> Option<Stat> {
        self.proc.frame = [fd as usize, STAT, 0, 0, 0, 0];
        if into_ret(self.ctx().sys_fstat()) < 0 {
            return None;
        }
        let mut bytes = [0u8; core::mem::size_of::<Stat>()];
        self.proc.mem.copy_in(&mut bytes, STAT).expect("stat bytes");
        Some(Stat::read_from(&bytes[..]).unwrap())
    }

    pub fn dup(&mut self, fd: i64) -> i64 {
        self.proc.frame = [fd as usize, 0, 0, 0, 0, 0];
        into_ret(self.ctx().sys_dup())
    }

    pub fn link(&mut self, old: &str, new: &str) -> i64 {
        self.put_str(PATH0, old);
        self.put_str(PATH1, new);
        self.proc.frame = [PATH0, PATH1, 0, 0, 0, 0];
        into_ret(self.ctx().sys_link())
    }

    pub fn unlink(&mut self, path: &str) -> i64 {
        self.put_str(PATH0, path);
        self.proc.frame = [PATH0, 0, 0, 0, 0, 0];
        into_ret(self.ctx().sys_unlink())
    }

    pub fn mkdir(&mut self, path: &str) -> i64 {
        self.put_str(PATH0, path);
        self.proc.frame = [PATH0, 0, 0, 0, 0, 0];
        into_ret(self.ctx().sys_mkdir())
    }

    pub fn mknod(&mut self, path: &str, major: i32, minor: i32) -> i64 {
        self.put_str(PATH0, path);
        self.proc.frame = [PATH0, major as usize, minor as usize, 0, 0, 0];
        into_ret(self.ctx().sys_mknod())
    }

    pub fn chdir(&mut self, path: &str) -> i64 {
        self.put_str(PATH0, path);
        self.proc.frame = [PATH0, 0, 0, 0, 0, 0];
        into_ret(self.ctx().sys_chdir())
    }

    pub fn pipe(&mut self) -> Option<(i64, i64)> {
        self.proc.frame = [FDS, 0, 0, 0, 0, 0];
        if into_ret(self.ctx().sys_pipe()) < 0 {
            return None;
        }
        let mut bytes = [0u8; 8];
        self.proc.mem.copy_in(&mut bytes, FDS).expect("pipe fds");
        let fd0 = i32::from_le_bytes(bytes[..4].try_into().unwrap());
        let fd1 = i32::from_le_bytes(bytes[4..].try_into().unwrap());
        Some((fd0 as i64, fd1 as i64))
    }

    fn superblock(&self) -> Superblock {
        let bp = self.kernel.bcache.read(1, 1);
        Superblock::new(&bp)
    }

    /// Number of data-bearing blocks currently free in the bitmap.
    pub fn free_blocks(&self) -> u32 {
        let sb = self.superblock();
        let mut free = 0;
        for b in 0..sb.size {
            let bp = self.kernel.bcache.read(1, sb.bblock(b));
            let bi = (b % BPB) as usize;
            if bp[bi / 8] & (1 << (bi % 8)) == 0 {
                free += 1;
            }
        }
        free
    }

    /// Number of allocated on-disk inodes.
    pub fn used_inodes(&self) -> u32 {
        let sb = self.superblock();
        let mut used = 0;
        for inum in 1..sb.ninodes {
            let bp = self.kernel.bcache.read(1, sb.iblock(inum));
            let off = (inum as usize % kvfs::fs::xv6fs::IPB)
                * core::mem::size_of::<kvfs::fs::xv6fs::Dinode>();
            let dip = kvfs::fs::xv6fs::Dinode::read_from_prefix(&bp[off..]).unwrap();
            if dip.typ != 0 {
                used += 1;
            }
        }
        used
    }
}
