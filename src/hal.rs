//! Block device interface.
//!
//! The core reaches the disk only through [`BlockDevice`]: indexed
//! random-access [`BSIZE`]-byte blocks. Drivers (virtio, ramdisk, a file on
//! the host) implement it; [`MemDisk`] is the RAM-backed device used by
//! tests and by `mkfs`.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::lock::SpinLock;
use crate::param::BSIZE;

pub trait BlockDevice: Send + Sync {
    /// Reads block `bno` into `buf`.
    fn read_block(&self, bno: u32, buf: &mut [u8; BSIZE]);

    /// Writes `buf` to block `bno`.
    fn write_block(&self, bno: u32, buf: &[u8; BSIZE]);

    /// Number of blocks on the device.
    fn nblocks(&self) -> u32;
}

impl<T: BlockDevice> BlockDevice for alloc::sync::Arc<T> {
    fn read_block(&self, bno: u32, buf: &mut [u8; BSIZE]) {
        (**self).read_block(bno, buf)
    }

    fn write_block(&self, bno: u32, buf: &[u8; BSIZE]) {
        (**self).write_block(bno, buf)
    }

    fn nblocks(&self) -> u32 {
        (**self).nblocks()
    }
}

/// A RAM-backed block device.
pub struct MemDisk {
    blocks: SpinLock<Vec<[u8; BSIZE]>>,
}

impl MemDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: SpinLock::new("memdisk", vec![[0; BSIZE]; nblocks as usize]),
        }
    }

    /// Clones the device contents, e.g. to simulate power loss and remount.
    pub fn snapshot(&self) -> Box<MemDisk> {
        let blocks = self.blocks.lock().clone();
        Box::new(MemDisk {
            blocks: SpinLock::new("memdisk", blocks),
        })
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, bno: u32, buf: &mut [u8; BSIZE]) {
        buf.copy_from_slice(&self.blocks.lock()[bno as usize]);
    }

    fn write_block(&self, bno: u32, buf: &[u8; BSIZE]) {
        self.blocks.lock()[bno as usize].copy_from_slice(buf);
    }

    fn nblocks(&self) -> u32 {
        self.blocks.lock().len() as u32
    }
}
