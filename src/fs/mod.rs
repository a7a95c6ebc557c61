//! The virtual file system layer.
//!
//! Every file-system-polymorphic call in the kernel is dispatched through
//! [`FilesystemOps`], the operation table a concrete file system supplies
//! when its [`FilesystemType`] is registered. The objects the layer trades
//! in are the classic four: [`SuperBlock`] (a mounted file system),
//! [`Inode`](inode::Inode) (a file's metadata, cached in a fixed table),
//! [`Dentry`](inode::Dentry) (a cached name → inode binding), and
//! [`File`](crate::file::File) (an open handle).

use alloc::boxed::Box;
use core::any::Any;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::error::Result;
use crate::file::{File, RcFile};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::{DEVSIZ, MAXMNT};

mod inode;
mod path;
mod stat;
pub mod xv6fs;

pub use inode::{Dentry, DentryRef, Dtable, Inode, InodeGuard, InodeInner, Itable, RcInode};
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEVICE, T_DIR, T_FILE};

/// Directory entries and path elements are at most this many bytes.
pub const DIRSIZ: usize = 14;

bitflags! {
    pub struct FcntlFlags: i32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
        const O_TRUNC = 0x400;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

/// A registered file system type: a name and the vtable it dispatches to.
pub struct FilesystemType {
    pub name: &'static str,
    pub op: &'static dyn FilesystemOps,
}

/// In-memory descriptor of a mounted file system.
pub struct SuperBlock {
    pub fstype: &'static FilesystemType,
    pub op: &'static dyn FilesystemOps,
    /// The superblock this one is mounted under; `None` for the root.
    pub parent: Option<&'static SuperBlock>,
    pub root: RcInode,
    /// The dentry this file system is mounted on; `None` for the root.
    pub mountpoint: Option<DentryRef>,
    /// Mount source, e.g. a device path. Bounded; excess is truncated.
    pub device: ArrayVec<u8, DEVSIZ>,
    pub mounts: SpinLock<ArrayVec<&'static SuperBlock, MAXMNT>>,
    /// FS-specific state; for xv6fs the cached on-disk superblock image.
    pub private: Box<dyn Any + Send + Sync>,
}

impl SuperBlock {
    pub fn device_name(&self) -> &[u8] {
        &self.device
    }
}

/// A transaction bracket around a group of disk writes.
///
/// Obtained from `begin_tx` on the operation-table object; ends (and
/// possibly commits) when dropped. Operations that may free disk blocks
/// take `&Tx` as witness that a bracket is open.
pub struct Tx<'s> {
    fs: &'s dyn FilesystemOps,
}

impl dyn FilesystemOps {
    /// Called at the start of each FS system call.
    pub fn begin_tx(&self) -> Tx<'_> {
        self.tx_begin();
        Tx { fs: self }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // Called at the end of each FS system call.
        // Commits if this was the last outstanding operation.
        self.fs.tx_end();
    }
}

/// The operation table every concrete file system supplies.
///
/// `read`/`write` move bytes through a data sink/source closure because
/// copying to kernel memory and to user memory are different operations;
/// the closure receives the offset relative to the start of the request
/// and the block-cache window for it.
pub trait FilesystemOps: Send + Sync {
    /// Initializes the file system on `dev` (loading from the disk).
    /// Invoked once at boot, before `mount`.
    fn init(&'static self, kernel: &'static Kernel, dev: u32) -> Result<()>;

    /// Mounts the file system and returns its superblock.
    /// Only used for the root mount at this stage.
    fn mount(&'static self, fstype: &'static FilesystemType, source: &str) -> Result<SuperBlock>;

    /// Unmounts. Ignored at this stage.
    fn umount(&self, sb: &SuperBlock) -> Result<()>;

    /// Starts a transaction. Use `begin_tx` on the trait object instead.
    fn tx_begin(&self);

    /// Ends a transaction; commits if it was the last outstanding one.
    fn tx_end(&self);

    /// Allocates an inode in the on-disk inode table.
    /// Returns an unlocked but allocated and referenced inode.
    fn alloc_inode(&'static self, sb: &'static SuperBlock, tx: &Tx<'_>) -> Result<RcInode>;

    /// Writes (updates) an existing inode to disk.
    /// Must be called after every change to a field that lives on disk.
    fn write_inode(&'static self, ip: &mut InodeGuard<'_>, tx: &Tx<'_>);

    /// Called when the in-memory inode is recycled; drops the FS-private
    /// payload.
    fn release_inode(&self, ip: &mut InodeGuard<'_>);

    /// Frees the inode in the on-disk inode table (the zeroed type has
    /// already been written back) and drops the FS-private payload.
    fn free_inode(&self, ip: &mut InodeGuard<'_>, tx: &Tx<'_>);

    /// Truncates the file to zero length, returning its blocks to the
    /// allocator.
    fn trunc(&'static self, ip: &mut InodeGuard<'_>, tx: &Tx<'_>);

    /// Opens the inode, producing a file. On failure the inode reference is
    /// handed back so the caller can release it inside its transaction.
    fn open(
        &'static self,
        ip: RcInode,
        omode: FcntlFlags,
    ) -> core::result::Result<RcFile, (RcInode, crate::error::FsError)>;

    /// Releases a closed file: the last reference is gone and the file has
    /// been detached from the table.
    fn close(&'static self, f: File);

    /// Reads `n` bytes at `off` from the inode's content into `sink`.
    /// Returns the number of bytes delivered.
    fn read(
        &'static self,
        ip: &mut InodeGuard<'_>,
        off: u32,
        n: u32,
        sink: &mut dyn FnMut(u32, &[u8]) -> Result<()>,
    ) -> Result<usize>;

    /// Writes `n` bytes at `off` into the inode's content from `src`.
    /// Returns the number of bytes written; fewer than `n` signals an error.
    fn write(
        &'static self,
        ip: &mut InodeGuard<'_>,
        off: u32,
        n: u32,
        src: &mut dyn FnMut(u32, &mut [u8]) -> Result<()>,
        tx: &Tx<'_>,
    ) -> Result<usize>;

    /// Finishes creation of a freshly allocated inode: records the device
    /// numbers in the FS-private state.
    fn create(&self, ip: &mut InodeGuard<'_>, major: u16, minor: u16, tx: &Tx<'_>) -> Result<()>;

    /// Writes a new directory entry (`de.name` → `de.inode`) into the
    /// directory `dp`. Fails if the name is already present.
    fn link(&'static self, dp: &mut InodeGuard<'_>, de: &Dentry, tx: &Tx<'_>) -> Result<()>;

    /// Removes every entry named `de.name` from the directory `dp`. The
    /// caller, not this primitive, maintains `nlink`.
    fn unlink(&'static self, dp: &mut InodeGuard<'_>, de: &Dentry, tx: &Tx<'_>) -> Result<()>;

    /// Looks for a directory entry in the directory `dp`. The returned
    /// dentry owns a reference on the target inode (and on `dp`).
    fn dirlookup(&'static self, dp: &mut InodeGuard<'_>, name: &FileName) -> Result<DentryRef>;

    /// Called when a dentry is recycled.
    fn release_dentry(&self, de: &mut Dentry);

    /// Is the directory empty except for `.` and `..`?
    fn isdirempty(&'static self, dp: &mut InodeGuard<'_>) -> bool;

    /// Finds the in-memory inode for `(dev, inum)`, attaching this file
    /// system to it. Does not lock it and does not read it from disk.
    fn geti(&'static self, dev: u32, inum: u32) -> Result<RcInode>;

    /// Populates a locked inode whose metadata has not been read yet.
    /// Invoked from `lock` when the FS-private payload is absent.
    fn update_lock(&'static self, ip: &mut InodeGuard<'_>);
}
