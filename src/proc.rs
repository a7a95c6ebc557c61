//! The slice of per-process state the file system core consumes: the current
//! directory, the open-file table, the user address space the copy
//! primitives target, and the syscall argument frame.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{FsError, Result};
use crate::file::RcFile;
use crate::fs::RcInode;
use crate::kernel::Kernel;
use crate::param::NOFILE;

/// A process's user address space, as the copy primitives see it: a flat
/// range of bytes addressed from zero.
pub struct UserMemory {
    mem: Vec<u8>,
}

impl UserMemory {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
        }
    }

    fn window(&self, addr: usize, len: usize) -> Result<core::ops::Range<usize>> {
        let end = addr.checked_add(len).ok_or(FsError::InvalidArgument)?;
        if end > self.mem.len() {
            return Err(FsError::InvalidArgument);
        }
        Ok(addr..end)
    }

    /// Copies from kernel memory into the user address space.
    pub fn copy_out(&mut self, addr: usize, src: &[u8]) -> Result<()> {
        let window = self.window(addr, src.len())?;
        self.mem[window].copy_from_slice(src);
        Ok(())
    }

    /// Copies from the user address space into kernel memory.
    pub fn copy_in(&self, dst: &mut [u8], addr: usize) -> Result<()> {
        let window = self.window(addr, dst.len())?;
        dst.copy_from_slice(&self.mem[window]);
        Ok(())
    }

    /// Fetches a word-sized value at `addr`.
    pub fn fetch_addr(&self, addr: usize) -> Result<usize> {
        let mut bytes = [0u8; core::mem::size_of::<usize>()];
        self.copy_in(&mut bytes, addr)?;
        Ok(usize::from_le_bytes(bytes))
    }

    /// Fetches the NUL-terminated string at `addr`, at most `max` bytes.
    pub fn fetch_str(&self, addr: usize, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for i in 0..max {
            let mut ch = [0u8];
            self.copy_in(&mut ch, addr + i)?;
            if ch[0] == 0 {
                return Ok(out);
            }
            out.push(ch[0]);
        }
        Err(FsError::InvalidArgument)
    }
}

/// Per-process state.
pub struct Proc {
    /// Current directory.
    pub cwd: Option<RcInode>,

    /// Open files.
    pub ofile: [Option<RcFile>; NOFILE],

    pub mem: UserMemory,

    /// Word-sized syscall arguments, as the trap handler left them.
    pub frame: [usize; 6],
}

impl Proc {
    /// A process rooted at `/` with an empty descriptor table.
    pub fn new(kernel: &'static Kernel, memsize: usize) -> Self {
        Self {
            cwd: Some(kernel.root_sb().root.dup()),
            ofile: core::array::from_fn(|_| None),
            mem: UserMemory::new(memsize),
            frame: [0; 6],
        }
    }
}
