//! Support functions for system calls that involve file descriptors.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::cmp;
use core::ops::Deref;

use crate::error::{FsError, Result};
use crate::fs::{FilesystemOps, RcInode};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::{BSIZE, MAXOPBLOCKS, NDEV, NFILE};
use crate::pipe::Pipe;
use crate::proc::UserMemory;

/// What an open file refers to.
pub enum FileType {
    None,
    Pipe {
        pipe: Arc<Pipe>,
    },
    Inode {
        ip: RcInode,
        /// Byte offset. Read and written only while the inode lock is held.
        off: UnsafeCell<u32>,
    },
    Device {
        ip: RcInode,
        major: u16,
    },
}

/// An open file.
pub struct File {
    pub op: Option<&'static dyn FilesystemOps>,
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

// SAFETY: the interior-mutable offset is accessed only under the inode's
// sleep-lock; everything else is frozen while the file is shared.
unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    pub fn new(
        op: Option<&'static dyn FilesystemOps>,
        typ: FileType,
        readable: bool,
        writable: bool,
    ) -> Self {
        Self {
            op,
            typ,
            readable,
            writable,
        }
    }

    fn none() -> Self {
        Self {
            op: None,
            typ: FileType::None,
            readable: false,
            writable: false,
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn into_type(self) -> FileType {
        self.typ
    }

    /// Reads from the file into user memory at `addr`.
    pub fn read(&self, kernel: &'static Kernel, mem: &mut UserMemory, addr: usize, n: usize) -> Result<usize> {
        if !self.readable {
            return Err(FsError::BadFileDescriptor);
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(mem, addr, n),
            FileType::Device { major, .. } => {
                let dev = kernel.devsw.get(*major).ok_or(FsError::NoDevice)?;
                let read = dev.read.ok_or(FsError::NoDevice)?;
                read(kernel, mem, addr, n)
            }
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock();
                // SAFETY: the offset is accessed only while the inode lock is
                // held, and we hold it.
                let off_v = unsafe { *off.get() };
                let r = guard.op().read(&mut guard, off_v, n as u32, &mut |o, src| {
                    mem.copy_out(addr + o as usize, src)
                })?;
                unsafe { *off.get() = off_v + r as u32 };
                Ok(r)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Writes to the file from user memory at `addr`.
    pub fn write(
        &self,
        kernel: &'static Kernel,
        mem: &mut UserMemory,
        addr: usize,
        n: usize,
    ) -> Result<usize> {
        if !self.writable {
            return Err(FsError::BadFileDescriptor);
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(mem, addr, n),
            FileType::Device { major, .. } => {
                let dev = kernel.devsw.get(*major).ok_or(FsError::NoDevice)?;
                let write = dev.write.ok_or(FsError::NoDevice)?;
                write(kernel, mem, addr, n)
            }
            FileType::Inode { ip, off } => {
                let op = self.op.expect("File::write: no operations");
                // Write a few blocks at a time to avoid exceeding the maximum
                // log transaction size, including i-node, indirect block,
                // allocation blocks, and 2 blocks of slop for non-aligned
                // writes. This really belongs lower down, since writei()
                // might be writing a device like the console.
                let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
                let mut i = 0;
                while i < n {
                    let n1 = cmp::min(n - i, max);
                    let ops: &dyn FilesystemOps = op;
                    let tx = ops.begin_tx();
                    let mut guard = ip.lock();
                    // SAFETY: offset accessed under the inode lock.
                    let off_v = unsafe { *off.get() };
                    let r = op.write(
                        &mut guard,
                        off_v,
                        n1 as u32,
                        &mut |o, dst| mem.copy_in(dst, addr + i + o as usize),
                        &tx,
                    )?;
                    unsafe { *off.get() = off_v + r as u32 };
                    drop(guard);
                    drop(tx);
                    if r != n1 {
                        // Error from writei; the written prefix stays on disk.
                        return Err(FsError::IoError);
                    }
                    i += r;
                }
                Ok(n)
            }
            FileType::None => panic!("File::write"),
        }
    }

    /// Copies metadata about the file to user memory at `addr`.
    pub fn stat(&self, mem: &mut UserMemory, addr: usize) -> Result<()> {
        use zerocopy::AsBytes;
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let guard = ip.lock();
                let st = guard.stat();
                drop(guard);
                mem.copy_out(addr, st.as_bytes())
            }
            _ => Err(FsError::BadFileDescriptor),
        }
    }
}

/// The open-file table.
pub struct Ftable {
    refs: SpinLock<[usize; NFILE]>,
    files: [UnsafeCell<File>; NFILE],
}

// SAFETY: a slot's `File` is written only while being claimed (ref 0 -> 1)
// or released (ref 1 -> 0) under the table lock, and is otherwise shared
// read-only through `RcFile`.
unsafe impl Sync for Ftable {}

impl Ftable {
    pub fn new() -> Self {
        Self {
            refs: SpinLock::new("ftable", [0; NFILE]),
            files: core::array::from_fn(|_| UnsafeCell::new(File::none())),
        }
    }

    /// Allocates a file structure. Hands `f` back if every slot is taken.
    pub fn alloc(&'static self, f: File) -> core::result::Result<RcFile, File> {
        let mut refs = self.refs.lock();
        for (i, r) in refs.iter_mut().enumerate() {
            if *r == 0 {
                *r = 1;
                // SAFETY: the slot had no handles and the table lock keeps it
                // from being claimed concurrently.
                unsafe { *self.files[i].get() = f };
                return Ok(RcFile {
                    table: self,
                    idx: i,
                });
            }
        }
        Err(f)
    }

    /// Number of live handles on `f`'s slot. Test and diagnostics aid.
    pub fn ref_count(&self, f: &RcFile) -> usize {
        self.refs.lock()[f.idx]
    }
}

/// A counted reference to an open file.
pub struct RcFile {
    table: &'static Ftable,
    idx: usize,
}

// SAFETY: `File` itself is Send + Sync; the handle adds only bookkeeping.
unsafe impl Send for RcFile {}
unsafe impl Sync for RcFile {}

impl Deref for RcFile {
    type Target = File;

    fn deref(&self) -> &File {
        // SAFETY: the slot content is frozen while any handle exists.
        unsafe { &*self.table.files[self.idx].get() }
    }
}

impl RcFile {
    /// Increments the ref count for the file.
    pub fn dup(&self) -> RcFile {
        let mut refs = self.table.refs.lock();
        refs[self.idx] += 1;
        RcFile {
            table: self.table,
            idx: self.idx,
        }
    }

    /// Closes the file: decrements the ref count and performs the release
    /// actions exactly when it reaches zero.
    pub fn close(self) {
        let mut refs = self.table.refs.lock();
        assert!(refs[self.idx] >= 1, "fileclose");
        refs[self.idx] -= 1;
        if refs[self.idx] > 0 {
            return;
        }
        // Take the file out of the slot before releasing the table lock, so
        // the slot can be reused while we run the release actions.
        // SAFETY: the last handle is gone and the table lock is held.
        let f = unsafe { core::mem::replace(&mut *self.table.files[self.idx].get(), File::none()) };
        drop(refs);

        match f.op {
            Some(op) => op.close(f),
            None => debug_assert!(matches!(f.typ, FileType::None)),
        }
    }
}

/// Device read/write entry points, dispatched by major number.
pub type DevRw = fn(&'static Kernel, &mut UserMemory, usize, usize) -> Result<usize>;

#[derive(Copy, Clone, Default)]
pub struct DevswRow {
    pub read: Option<DevRw>,
    pub write: Option<DevRw>,
}

/// Maps major device numbers to device functions.
pub struct Devsw {
    rows: SpinLock<[DevswRow; NDEV]>,
}

impl Devsw {
    pub fn new() -> Self {
        Self {
            rows: SpinLock::new("devsw", [DevswRow::default(); NDEV]),
        }
    }

    /// Wires a device row; replaces any previous wiring for `major`.
    pub fn set(&self, major: usize, read: Option<DevRw>, write: Option<DevRw>) {
        assert!(major < NDEV, "devsw: bad major");
        self.rows.lock()[major] = DevswRow { read, write };
    }

    /// Returns the row for `major` if it is wired.
    pub fn get(&self, major: u16) -> Option<DevswRow> {
        let rows = self.rows.lock();
        let row = rows.get(major as usize)?;
        if row.read.is_none() && row.write.is_none() {
            None
        } else {
            Some(*row)
        }
    }
}
