//! File system implementation. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /usr/rtm/xv6/fs.c for convenient naming.
//!
//! This module contains the low-level file system manipulation routines that
//! back the VFS operation table. The (higher-level) system call
//! implementations are in `syscall`.

use alloc::boxed::Box;
use core::cell::UnsafeCell;

use spin::Once;

use crate::bio::{Bcache, Buf};
use crate::error::{FsError, Result};
use crate::file::{File, FileType, RcFile};
use crate::fs::{
    Dentry, DentryRef, FcntlFlags, FileName, FilesystemOps, FilesystemType, InodeGuard, InodeType,
    RcInode, SuperBlock, Tx,
};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::NDEV;

mod inode;
mod log;
mod mkfs;
mod superblock;

pub use inode::{Dinode, Dirent, Xv6Inode, DIRENT_SIZE, MAXFILE, NDIRECT, NINDIRECT};
pub use log::Log;
pub use mkfs::mkfs;
pub use superblock::{Superblock, BPB, FSMAGIC, IPB};

/// Root i-number.
pub const ROOTINO: u32 = 1;

/// The classic unix-v6-style file system.
///
/// There should be one superblock per disk device, but we run with only one
/// device; `init` binds the instance to it.
pub struct Xv6fs {
    kernel: Once<&'static Kernel>,
    dev: Once<u32>,
    superblock: Once<Superblock>,
    log: Once<SpinLock<Log>>,
}

impl Xv6fs {
    pub const fn new() -> Self {
        Self {
            kernel: Once::new(),
            dev: Once::new(),
            superblock: Once::new(),
            log: Once::new(),
        }
    }

    fn kernel(&self) -> &'static Kernel {
        *self.kernel.get().expect("xv6fs: not initialized")
    }

    pub(super) fn bcache(&self) -> &'static Bcache {
        &self.kernel().bcache
    }

    pub(super) fn dev(&self) -> u32 {
        *self.dev.get().expect("xv6fs: not initialized")
    }

    pub(super) fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("xv6fs: no superblock")
    }

    fn log(&self) -> &SpinLock<Log> {
        self.log.get().expect("xv6fs: no log")
    }

    /// Routes a modified buffer into the current transaction.
    pub(super) fn log_write(&self, b: Buf, _tx: &Tx<'_>) {
        self.log().lock().write(b);
    }

    /// Zeroes a block.
    fn bzero(&'static self, dev: u32, bno: u32, tx: &Tx<'_>) {
        let mut bp = self.bcache().read(dev, bno);
        bp.fill(0);
        self.log_write(bp, tx);
    }

    /// Allocates a zeroed disk block, or fails if out of disk space.
    pub(super) fn balloc(&'static self, dev: u32, tx: &Tx<'_>) -> Result<u32> {
        let sb = self.superblock();
        for b in (0..sb.size).step_by(BPB as usize) {
            let mut bp = self.bcache().read(dev, sb.bblock(b));
            for bi in 0..BPB.min(sb.size - b) {
                let m = 1u8 << (bi % 8);
                if bp[bi as usize / 8] & m == 0 {
                    // Block is free.
                    bp[bi as usize / 8] |= m; // Mark block in use.
                    self.log_write(bp, tx);
                    self.bzero(dev, b + bi, tx);
                    return Ok(b + bi);
                }
            }
        }
        ::log::warn!("balloc: out of blocks");
        Err(FsError::NoSpace)
    }

    /// Frees a disk block.
    pub(super) fn bfree(&'static self, dev: u32, b: u32, tx: &Tx<'_>) {
        let sb = self.superblock();
        let mut bp = self.bcache().read(dev, sb.bblock(b));
        let bi = b as usize % BPB as usize;
        let m = 1u8 << (bi % 8);
        assert_ne!(bp[bi / 8] & m, 0, "freeing free block");
        bp[bi / 8] &= !m;
        self.log_write(bp, tx);
    }
}

impl FilesystemOps for Xv6fs {
    fn init(&'static self, kernel: &'static Kernel, dev: u32) -> Result<()> {
        self.kernel.call_once(|| kernel);
        self.dev.call_once(|| dev);
        let sb = self.superblock.call_once(|| {
            let bp = kernel.bcache.read(dev, 1);
            Superblock::new(&bp)
        });
        self.log.call_once(|| {
            SpinLock::new(
                "log",
                Log::new(&kernel.bcache, dev, sb.logstart, sb.nlog),
            )
        });
        ::log::info!(
            "xv6fs: dev {} size {} ninodes {} nlog {}",
            dev,
            sb.size,
            sb.ninodes,
            sb.nlog
        );
        Ok(())
    }

    fn mount(&'static self, fstype: &'static FilesystemType, source: &str) -> Result<SuperBlock> {
        let root = self.geti(self.dev(), ROOTINO)?;
        let mut device: arrayvec::ArrayVec<u8, { crate::param::DEVSIZ }> =
            arrayvec::ArrayVec::new();
        for b in source.bytes().take(device.capacity()) {
            device.push(b);
        }
        Ok(SuperBlock {
            fstype,
            op: self,
            parent: None,
            root,
            mountpoint: None,
            device,
            mounts: SpinLock::new("mounts", arrayvec::ArrayVec::new()),
            private: Box::new(*self.superblock()),
        })
    }

    fn umount(&self, _sb: &SuperBlock) -> Result<()> {
        // Ignored at this stage.
        Ok(())
    }

    fn tx_begin(&self) {
        self.log().begin_op();
    }

    fn tx_end(&self) {
        self.log().end_op();
    }

    fn alloc_inode(&'static self, _sb: &'static SuperBlock, tx: &Tx<'_>) -> Result<RcInode> {
        self.ialloc(tx)
    }

    fn write_inode(&'static self, ip: &mut InodeGuard<'_>, tx: &Tx<'_>) {
        self.iupdate(ip, tx);
    }

    fn release_inode(&self, ip: &mut InodeGuard<'_>) {
        ip.typ = InodeType::None;
        ip.private = None;
    }

    fn free_inode(&self, ip: &mut InodeGuard<'_>, _tx: &Tx<'_>) {
        // The zeroed type was written back by the caller, freeing the disk
        // slot; drop the in-memory payload.
        ip.private = None;
    }

    fn trunc(&'static self, ip: &mut InodeGuard<'_>, tx: &Tx<'_>) {
        self.itrunc(ip, tx);
    }

    fn open(
        &'static self,
        ip: RcInode,
        omode: FcntlFlags,
    ) -> core::result::Result<RcFile, (RcInode, FsError)> {
        let guard = ip.lock();
        let typ = guard.typ;
        drop(guard);

        let filetype = match typ {
            InodeType::Device { major, .. } => {
                if major as usize >= NDEV || self.kernel().devsw.get(major).is_none() {
                    return Err((ip, FsError::NoDevice));
                }
                FileType::Device { ip, major }
            }
            _ => FileType::Inode {
                ip,
                off: UnsafeCell::new(0),
            },
        };

        let readable = !omode.intersects(FcntlFlags::O_WRONLY);
        let writable = omode.intersects(FcntlFlags::O_WRONLY | FcntlFlags::O_RDWR);
        let f = File::new(Some(self), filetype, readable, writable);
        self.kernel().ftable.alloc(f).map_err(|f| {
            match f.into_type() {
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                    (ip, FsError::TooManyOpenFiles)
                }
                _ => unreachable!("xv6fs: open built a file without an inode"),
            }
        })
    }

    fn close(&'static self, f: File) {
        let writable = f.writable();
        match f.into_type() {
            FileType::None => {}
            FileType::Pipe { pipe } => pipe.close(writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let ops: &dyn FilesystemOps = self;
                let tx = ops.begin_tx();
                ip.put(&tx);
            }
        }
    }

    fn read(
        &'static self,
        ip: &mut InodeGuard<'_>,
        off: u32,
        n: u32,
        sink: &mut dyn FnMut(u32, &[u8]) -> Result<()>,
    ) -> Result<usize> {
        self.readi(ip, off, n, sink)
    }

    fn write(
        &'static self,
        ip: &mut InodeGuard<'_>,
        off: u32,
        n: u32,
        src: &mut dyn FnMut(u32, &mut [u8]) -> Result<()>,
        tx: &Tx<'_>,
    ) -> Result<usize> {
        self.writei(ip, off, n, src, tx)
    }

    fn create(&self, ip: &mut InodeGuard<'_>, major: u16, minor: u16, _tx: &Tx<'_>) -> Result<()> {
        let payload = ip
            .private
            .as_mut()
            .expect("xv6fs: create before load")
            .downcast_mut::<Xv6Inode>()
            .expect("xv6fs: foreign inode payload");
        payload.major = major;
        payload.minor = minor;
        Ok(())
    }

    fn link(&'static self, dp: &mut InodeGuard<'_>, de: &Dentry, tx: &Tx<'_>) -> Result<()> {
        let inum = de
            .inode
            .as_ref()
            .expect("xv6fs: link without target")
            .inum();
        self.dirlink(dp, &de.name, inum, tx)
    }

    fn unlink(&'static self, dp: &mut InodeGuard<'_>, de: &Dentry, tx: &Tx<'_>) -> Result<()> {
        // Zero every entry carrying the name.
        for off in (0..dp.size).step_by(DIRENT_SIZE) {
            let ent: Dirent = self.read_kernel(dp, off).expect("unlink read");
            if ent.inum != 0 && ent.name_bytes() == de.name.as_bytes() {
                self.write_kernel(dp, &Dirent::default(), off, tx)
                    .expect("unlink: writei");
            }
        }
        Ok(())
    }

    fn dirlookup(&'static self, dp: &mut InodeGuard<'_>, name: &FileName) -> Result<DentryRef> {
        let (inum, _off) = self.lookup_entry(dp, name)?;
        // Claim the dentry before taking the inode reference, so an exhausted
        // pool fails without leaking a ref.
        let mut de = self.kernel().dtable.get_blank()?;
        de.op = Some(self);
        de.parent = Some(dp.ip.dup());
        de.name = *name;
        de.inode = Some(self.geti(dp.dev(), inum)?);
        Ok(de)
    }

    fn release_dentry(&self, _de: &mut Dentry) {
        // Nothing beyond the pool bookkeeping at this stage.
    }

    fn isdirempty(&'static self, dp: &mut InodeGuard<'_>) -> bool {
        self.dir_is_empty(dp)
    }

    fn geti(&'static self, dev: u32, inum: u32) -> Result<RcInode> {
        let kernel = self.kernel();
        Ok(kernel
            .itable
            .get(dev, inum, self, kernel.try_root_sb()))
    }

    fn update_lock(&'static self, ip: &mut InodeGuard<'_>) {
        self.load_inode(ip);
    }
}

/// Builds a fresh `xv6fs` registration record. Each kernel registers its own
/// instance, since an instance is bound to one device and one kernel.
pub fn new_fstype() -> &'static FilesystemType {
    let op: &'static Xv6fs = Box::leak(Box::new(Xv6fs::new()));
    Box::leak(Box::new(FilesystemType { name: "xv6fs", op }))
}
