//! Inodes.
//!
//! An inode describes a single unnamed file. The kernel keeps a table of
//! in-use inodes in memory to provide a place for synchronizing access to
//! inodes used by multiple tasks.
//!
//! An inode and its in-memory representation go through a sequence of states
//! before they can be used by the rest of the file system code.
//!
//! * Referencing in table: an entry in the inode table is free if its ref
//!   count is zero. Otherwise it tracks the number of in-memory handles to
//!   the entry (open files and current directories). [`Itable::get`] finds or
//!   creates a table entry and increments its ref; [`RcInode::put`]
//!   decrements it.
//!
//! * Valid: the information (type, size, &c) in a table entry is only correct
//!   once the FS-private payload has been loaded. [`RcInode::lock`] reads the
//!   inode from disk on first use, and `put` drops the payload when the ref
//!   count falls to zero.
//!
//! * Locked: file system code may only examine and modify the information in
//!   an inode and its content through an [`InodeGuard`].
//!
//! Thus a typical sequence is:
//!   let ip = fs.geti(dev, inum)?;
//!   let mut g = ip.lock();
//!   ... examine and modify through g ...
//!   drop(g);
//!   ip.put(&tx);
//!
//! `lock` is separate from `get` so that system calls can hold a long-term
//! reference to an inode (as for an open file) and only lock it for short
//! periods (e.g., in read). The separation also helps avoid deadlock and
//! races during pathname lookup.
//!
//! The itable spin-lock protects the allocation of table entries and every
//! ref count; the per-inode sleep-lock protects all other inode fields. The
//! identity and attachment fields (dev, inum, op, sb) are written only while
//! an entry is claimed (ref 0 → 1) under the itable lock, and are frozen
//! while any handle exists.

use alloc::boxed::Box;
use core::any::Any;
use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{FsError, Result};
use crate::kernel::Kernel;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{NDENTRY, NINODE};
use crate::proc::Proc;

use super::path::{FileName, Path};
use super::stat::{Stat, T_DEVICE, T_DIR, T_FILE};
use super::{FilesystemOps, InodeType, SuperBlock, Tx};

/// The fields of an inode protected by its sleep-lock.
pub struct InodeInner {
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    /// FS-specific payload; `None` until the first lock loads it from disk.
    pub private: Option<Box<dyn Any + Send>>,
}

/// In-memory copy of an inode.
pub struct Inode {
    /// Device number. Frozen while any handle exists.
    dev: AtomicU32,

    /// Inode number. Frozen while any handle exists.
    inum: AtomicU32,

    /// Operation table, attached when the slot is claimed.
    op: Cell<Option<&'static dyn FilesystemOps>>,

    /// The mounted file system this inode belongs to.
    sb: Cell<Option<&'static SuperBlock>>,

    inner: SleepLock<InodeInner>,
}

// SAFETY: the `Cell` fields are written only while the entry is claimed
// (ref 0 -> 1) under the itable lock, with no other handle in existence, and
// are read-only afterwards.
unsafe impl Sync for Inode {}

impl Inode {
    fn new() -> Self {
        Self {
            dev: AtomicU32::new(0),
            inum: AtomicU32::new(0),
            op: Cell::new(None),
            sb: Cell::new(None),
            inner: SleepLock::new(
                "inode",
                InodeInner {
                    typ: InodeType::None,
                    nlink: 0,
                    size: 0,
                    private: None,
                },
            ),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev.load(Ordering::Relaxed)
    }

    pub fn inum(&self) -> u32 {
        self.inum.load(Ordering::Relaxed)
    }

    pub fn op(&self) -> &'static dyn FilesystemOps {
        self.op.get().expect("inode: no operations attached")
    }

    pub fn sb(&self) -> Option<&'static SuperBlock> {
        self.sb.get()
    }
}

/// The in-memory inode table.
pub struct Itable {
    /// Ref count per slot; doubles as the free marker.
    refs: SpinLock<[usize; NINODE]>,
    inodes: [Inode; NINODE],
}

impl Itable {
    pub fn new() -> Self {
        Self {
            refs: SpinLock::new("itable", [0; NINODE]),
            inodes: core::array::from_fn(|_| Inode::new()),
        }
    }

    /// Finds the inode with number `inum` on device `dev` and returns a
    /// handle to the in-memory copy, attaching `op` on a miss. Does not lock
    /// the inode and does not read it from disk.
    ///
    /// Panics if the table is full: the core cannot make progress without a
    /// free slot, and callers hold no state that would let them recover.
    pub fn get(
        &'static self,
        dev: u32,
        inum: u32,
        op: &'static dyn FilesystemOps,
        sb: Option<&'static SuperBlock>,
    ) -> RcInode {
        let mut refs = self.refs.lock();

        // Is the inode already in the table?
        let mut empty = None;
        for (i, ip) in self.inodes.iter().enumerate() {
            if refs[i] > 0 && ip.dev() == dev && ip.inum() == inum {
                refs[i] += 1;
                return RcInode { table: self, idx: i };
            }
            if empty.is_none() && refs[i] == 0 {
                empty = Some(i);
            }
        }

        // Recycle an inode entry.
        let i = empty.expect("iget: no inodes");
        let ip = &self.inodes[i];
        refs[i] = 1;
        ip.dev.store(dev, Ordering::Relaxed);
        ip.inum.store(inum, Ordering::Relaxed);
        ip.op.set(Some(op));
        ip.sb.set(sb);
        // SAFETY: the slot had no handles (ref was 0), so nobody holds its
        // sleep-lock, and the itable lock keeps it from being claimed
        // concurrently.
        let inner = unsafe { &mut *ip.inner.get_mut_raw() };
        inner.typ = InodeType::None;
        inner.nlink = 0;
        inner.size = 0;
        inner.private = None;
        RcInode { table: self, idx: i }
    }

    /// Late attachment of the superblock back-reference, for the root inode
    /// acquired while its superblock was still being built.
    pub fn attach_sb(&self, ip: &RcInode, sb: &'static SuperBlock) {
        let _refs = self.refs.lock();
        self.inodes[ip.idx].sb.set(Some(sb));
    }

    /// Number of live handles on `ip`'s slot. Test and diagnostics aid.
    pub fn ref_count(&self, ip: &RcInode) -> usize {
        self.refs.lock()[ip.idx]
    }

    /// Looks up and returns the inode for a path name.
    /// Must be called inside a transaction since it calls `put`.
    pub fn namei(
        &'static self,
        kernel: &'static Kernel,
        path: &Path,
        proc: &Proc,
        tx: &Tx<'_>,
    ) -> Result<RcInode> {
        Ok(self.namex(kernel, path, false, proc, tx)?.0)
    }

    /// Looks up the parent directory of `path`, also yielding the final path
    /// element.
    pub fn nameiparent(
        &'static self,
        kernel: &'static Kernel,
        path: &Path,
        proc: &Proc,
        tx: &Tx<'_>,
    ) -> Result<(RcInode, FileName)> {
        let (ip, name) = self.namex(kernel, path, true, proc, tx)?;
        Ok((ip, name.ok_or(FsError::NotFound)?))
    }

    fn namex(
        &'static self,
        kernel: &'static Kernel,
        mut path: &Path,
        parent: bool,
        proc: &Proc,
        tx: &Tx<'_>,
    ) -> Result<(RcInode, Option<FileName>)> {
        let mut ip = if path.is_absolute() {
            kernel.root_sb().root.dup()
        } else {
            proc.cwd.as_ref().expect("namex: no cwd").dup()
        };

        while let Some((rest, name)) = path.skipelem() {
            path = rest;

            let mut guard = ip.lock();
            if guard.typ != InodeType::Dir {
                drop(guard);
                ip.put(tx);
                return Err(FsError::NotDirectory);
            }
            if parent && path.is_empty() {
                // Stop one level early.
                drop(guard);
                return Ok((ip, Some(name)));
            }
            let next = match guard.op().dirlookup(&mut guard, &name) {
                Ok(mut de) => {
                    let next = de.inode.take();
                    de.free(tx);
                    next
                }
                Err(_) => None,
            };
            drop(guard);
            ip.put(tx);
            match next {
                Some(next) => ip = next,
                None => return Err(FsError::NotFound),
            }
        }
        if parent {
            ip.put(tx);
            return Err(FsError::NotFound);
        }
        Ok((ip, None))
    }
}

/// A counted reference to an inode table entry.
///
/// There is no implicit release: a handle must be consumed by [`RcInode::put`]
/// (inside a transaction). A handle that is simply dropped pins its table
/// slot forever.
pub struct RcInode {
    table: &'static Itable,
    idx: usize,
}

impl Deref for RcInode {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.table.inodes[self.idx]
    }
}

impl RcInode {
    /// Increments the ref count and returns a second handle.
    pub fn dup(&self) -> RcInode {
        let mut refs = self.table.refs.lock();
        refs[self.idx] += 1;
        RcInode {
            table: self.table,
            idx: self.idx,
        }
    }

    /// Locks the inode, reading its metadata from disk if necessary.
    /// May suspend the current task.
    pub fn lock(&self) -> InodeGuard<'_> {
        let mut guard = self.lock_raw();
        if guard.private.is_none() {
            guard.ip.op().update_lock(&mut guard);
        }
        guard
    }

    /// Acquires the sleep-lock without loading metadata. `put` uses this to
    /// look at the load state itself.
    fn lock_raw(&self) -> InodeGuard<'_> {
        let guard = self.table.inodes[self.idx].inner.lock();
        InodeGuard { ip: self, guard }
    }

    /// Drops a reference to an in-memory inode.
    ///
    /// If that was the last reference, the table entry can be recycled; the
    /// inode is written back, and if it also has no links it is truncated and
    /// freed on disk. All calls must be inside a transaction in case the
    /// inode has to free blocks.
    pub fn put(self, tx: &Tx<'_>) {
        let refs = self.table.refs.lock();
        if refs[self.idx] == 1 {
            // ref == 1 means no other task can have the inode locked, so this
            // lock acquisition will not block (or deadlock).
            drop(refs);
            let mut guard = self.lock_raw();
            if guard.private.is_some() {
                let op = guard.ip.op();
                if guard.nlink == 0 {
                    // No links and no other references: truncate and free.
                    guard.typ = InodeType::None;
                    op.trunc(&mut guard, tx);
                    op.write_inode(&mut guard, tx);
                    op.free_inode(&mut guard, tx);
                } else {
                    op.write_inode(&mut guard, tx);
                    op.release_inode(&mut guard);
                }
            }
            drop(guard);
        } else {
            drop(refs);
        }

        let mut refs = self.table.refs.lock();
        assert!(refs[self.idx] >= 1, "iput: no ref");
        refs[self.idx] -= 1;
    }
}

/// Witness that the inode's sleep-lock is held; grants access to the fields
/// it protects. Dropping the guard unlocks the inode.
pub struct InodeGuard<'a> {
    pub ip: &'a RcInode,
    guard: SleepLockGuard<'a, InodeInner>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &InodeInner {
        &self.guard
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut InodeInner {
        &mut self.guard
    }
}

impl InodeGuard<'_> {
    pub fn dev(&self) -> u32 {
        self.ip.dev()
    }

    pub fn inum(&self) -> u32 {
        self.ip.inum()
    }

    pub fn op(&self) -> &'static dyn FilesystemOps {
        self.ip.op()
    }

    /// Copies stat information out of the inode.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev(),
            ino: self.inum(),
            typ: match self.typ {
                InodeType::None => 0,
                InodeType::Dir => T_DIR,
                InodeType::File => T_FILE,
                InodeType::Device { .. } => T_DEVICE,
            },
            nlink: self.nlink,
            _padding: 0,
            size: self.size as u64,
        }
    }
}

/// A cached name → inode binding.
pub struct Dentry {
    pub op: Option<&'static dyn FilesystemOps>,
    /// The directory the entry lives in.
    pub parent: Option<RcInode>,
    pub name: FileName,
    /// The inode the entry names. A dentry produced by `dirlookup` owns one
    /// reference here.
    pub inode: Option<RcInode>,
    /// Is this dentry a mount point?
    pub ismount: bool,
    /// For a cached entry, has it already been unlinked?
    pub deleted: bool,
}

impl Dentry {
    fn blank() -> Self {
        Self {
            op: None,
            parent: None,
            name: FileName::empty(),
            inode: None,
            ismount: false,
            deleted: false,
        }
    }
}

/// The dentry pool: a fixed array of slots, no hashing; the cache is
/// advisory.
pub struct Dtable {
    in_use: SpinLock<[bool; NDENTRY]>,
    slots: [UnsafeCell<Dentry>; NDENTRY],
}

// SAFETY: each slot is reached only through the unique `DentryRef` handed out
// while its `in_use` flag is set.
unsafe impl Sync for Dtable {}

impl Dtable {
    pub fn new() -> Self {
        Self {
            in_use: SpinLock::new("dtable", [false; NDENTRY]),
            slots: core::array::from_fn(|_| UnsafeCell::new(Dentry::blank())),
        }
    }

    /// Claims the first free slot. Fails when the pool is exhausted.
    pub fn get_blank(&'static self) -> Result<DentryRef> {
        let mut in_use = self.in_use.lock();
        for (i, used) in in_use.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(DentryRef {
                    table: self,
                    idx: i,
                });
            }
        }
        Err(FsError::TooManyOpenFiles)
    }
}

/// Exclusive handle on a dentry pool slot.
pub struct DentryRef {
    table: &'static Dtable,
    idx: usize,
}

// SAFETY: the handle is the unique owner of its slot; access to the slot's
// data is mediated by borrows of the handle.
unsafe impl Send for DentryRef {}
unsafe impl Sync for DentryRef {}

impl Deref for DentryRef {
    type Target = Dentry;

    fn deref(&self) -> &Dentry {
        // SAFETY: unique owner; see `Dtable`.
        unsafe { &*self.table.slots[self.idx].get() }
    }
}

impl DerefMut for DentryRef {
    fn deref_mut(&mut self) -> &mut Dentry {
        // SAFETY: unique owner, and `&mut self` is exclusive.
        unsafe { &mut *self.table.slots[self.idx].get() }
    }
}

impl DentryRef {
    /// Returns the slot to the pool, releasing the inode references the
    /// dentry holds. Needs a transaction for the same reason `put` does.
    pub fn free(mut self, tx: &Tx<'_>) {
        if let Some(op) = self.op {
            op.release_dentry(&mut self);
        }
        if let Some(ip) = self.inode.take() {
            ip.put(tx);
        }
        if let Some(parent) = self.parent.take() {
            parent.put(tx);
        }
        *self = Dentry::blank();
        let mut in_use = self.table.in_use.lock();
        in_use[self.idx] = false;
    }
}
