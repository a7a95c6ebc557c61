//! System call support: argument marshalling and the file-system entries.
//!
//! Mostly argument checking, since we don't trust user code; the real work
//! happens in `file` and `fs`.

use alloc::vec::Vec;

use crate::error::{FsError, Result};
use crate::file::RcFile;
use crate::kernel::Kernel;
use crate::param::{MAXPATH, NOFILE};
use crate::proc::Proc;

mod file;

/// The kernel-side context of the task executing a system call.
pub struct KernelCtx<'p> {
    pub kernel: &'static Kernel,
    pub proc: &'p mut Proc,
}

impl<'p> KernelCtx<'p> {
    pub fn new(kernel: &'static Kernel, proc: &'p mut Proc) -> Self {
        Self { kernel, proc }
    }

    /// Fetches the n-th word-sized system call argument as an integer.
    pub fn arg_int(&self, n: usize) -> i32 {
        self.proc.frame[n] as i32
    }

    /// Fetches the n-th word-sized system call argument as an address.
    pub fn arg_addr(&self, n: usize) -> usize {
        self.proc.frame[n]
    }

    /// Fetches the n-th argument as a NUL-terminated string from user
    /// memory, bounded by MAXPATH.
    pub fn arg_str(&self, n: usize) -> Result<Vec<u8>> {
        self.proc.mem.fetch_str(self.arg_addr(n), MAXPATH)
    }

    /// Fetches the n-th argument as a file descriptor and checks it refers
    /// to an open file of this process.
    pub fn arg_fd(&self, n: usize) -> Result<usize> {
        let fd = self.arg_int(n);
        if fd < 0 || fd as usize >= NOFILE {
            return Err(FsError::BadFileDescriptor);
        }
        let fd = fd as usize;
        if self.proc.ofile[fd].is_none() {
            return Err(FsError::BadFileDescriptor);
        }
        Ok(fd)
    }

    /// Allocates a file descriptor for the given file, taking over the
    /// reference from the caller on success.
    fn fdalloc(&mut self, f: RcFile) -> core::result::Result<usize, RcFile> {
        for (fd, slot) in self.proc.ofile.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(f);
                return Ok(fd);
            }
        }
        Err(f)
    }
}

/// Collapses a syscall result into the user-visible return convention:
/// the value on success, -1 on any recoverable failure.
pub fn into_ret(r: Result<usize>) -> i64 {
    match r {
        Ok(v) => v as i64,
        Err(_) => -1,
    }
}
