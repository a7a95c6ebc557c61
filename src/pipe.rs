//! Pipes: a bounded byte ring shared by a read end and a write end.

use alloc::sync::Arc;

use crate::error::{FsError, Result};
use crate::file::{File, FileType, RcFile};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::proc::UserMemory;

pub const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,
}

impl Pipe {
    /// Allocates a pipe and the two files for its ends.
    pub fn alloc(kernel: &'static Kernel) -> Result<(RcFile, RcFile)> {
        let pipe = Arc::new(Pipe {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
        });

        let op = kernel.root_sb().op;
        let rf = File::new(Some(op), FileType::Pipe { pipe: pipe.clone() }, true, false);
        let wf = File::new(Some(op), FileType::Pipe { pipe }, false, true);

        let rf = kernel
            .ftable
            .alloc(rf)
            .map_err(|_| FsError::TooManyOpenFiles)?;
        match kernel.ftable.alloc(wf) {
            Ok(wf) => Ok((rf, wf)),
            Err(_) => {
                rf.close();
                Err(FsError::TooManyOpenFiles)
            }
        }
    }

    /// Closes one end.
    pub fn close(&self, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
        } else {
            inner.readopen = false;
        }
    }

    /// Reads up to `n` bytes into user memory at `addr`. Waits for data
    /// while the write end is open; returns 0 at end of file.
    pub fn read(&self, mem: &mut UserMemory, addr: usize, n: usize) -> Result<usize> {
        loop {
            let mut inner = self.inner.lock();
            if inner.nread == inner.nwrite {
                if !inner.writeopen {
                    return Ok(0);
                }
                // Wait for a writer.
                drop(inner);
                core::hint::spin_loop();
                continue;
            }

            let mut i = 0;
            while i < n && inner.nread != inner.nwrite {
                let ch = inner.data[inner.nread as usize % PIPESIZE];
                inner.nread += 1;
                mem.copy_out(addr + i, &[ch])?;
                i += 1;
            }
            return Ok(i);
        }
    }

    /// Writes `n` bytes from user memory at `addr`, waiting for the reader
    /// to drain the ring when it fills. Fails if the read end is closed.
    pub fn write(&self, mem: &UserMemory, addr: usize, n: usize) -> Result<usize> {
        let mut i = 0;
        while i < n {
            let mut inner = self.inner.lock();
            if !inner.readopen {
                return Err(FsError::BrokenPipe);
            }
            if inner.nwrite == inner.nread + PIPESIZE as u32 {
                // Ring is full; wait for the reader.
                drop(inner);
                core::hint::spin_loop();
                continue;
            }
            while i < n && inner.nwrite != inner.nread + PIPESIZE as u32 {
                let mut ch = [0u8];
                mem.copy_in(&mut ch, addr + i)?;
                let slot = inner.nwrite as usize % PIPESIZE;
                inner.data[slot] = ch[0];
                inner.nwrite += 1;
                i += 1;
            }
        }
        Ok(n)
    }
}
