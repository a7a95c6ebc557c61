//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching disk
//! blocks in memory reduces the number of disk reads and also provides a
//! synchronization point for blocks used by multiple tasks.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call [`Bcache::read`].
//! * After changing buffer data, call [`Bcache::write`] to write it to disk.
//! * A [`Buf`] releases its slot when dropped; do not keep buffers longer
//!   than necessary.
//! * [`Buf::unlock`] keeps the slot pinned without the lock, for the log.

use alloc::boxed::Box;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use arrayvec::ArrayVec;

use crate::hal::BlockDevice;
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{BSIZE, NBUF};

/// How many block devices the cache can front.
const NDISK: usize = 4;

struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: usize,
}

pub struct BufInner {
    /// Has data been read from disk?
    valid: bool,
    pub data: [u8; BSIZE],
}

pub struct Bcache {
    meta: SpinLock<[BufMeta; NBUF]>,
    inner: [SleepLock<BufInner>; NBUF],
    disks: ArrayVec<(u32, Box<dyn BlockDevice>), NDISK>,
}

impl Bcache {
    pub fn new(disks: impl IntoIterator<Item = (u32, Box<dyn BlockDevice>)>) -> Self {
        Self {
            meta: SpinLock::new(
                "bcache",
                core::array::from_fn(|_| BufMeta {
                    dev: u32::MAX,
                    blockno: u32::MAX,
                    refcnt: 0,
                }),
            ),
            inner: core::array::from_fn(|_| {
                SleepLock::new(
                    "buffer",
                    BufInner {
                        valid: false,
                        data: [0; BSIZE],
                    },
                )
            }),
            disks: disks.into_iter().collect(),
        }
    }

    pub fn disk(&self, dev: u32) -> &dyn BlockDevice {
        self.disks
            .iter()
            .find(|(d, _)| *d == dev)
            .map(|(_, disk)| &**disk)
            .expect("bio: unknown device")
    }

    /// Look through the buffer cache for block `blockno` on device `dev`.
    /// If not found, recycle an unused buffer.
    /// In either case, return a pinned slot index.
    fn get(&'static self, dev: u32, blockno: u32) -> usize {
        let mut meta = self.meta.lock();

        // Is the block already cached?
        for (i, b) in meta.iter_mut().enumerate() {
            if b.dev == dev && b.blockno == blockno {
                b.refcnt += 1;
                return i;
            }
        }

        // Not cached; recycle the first unused buffer.
        for (i, b) in meta.iter_mut().enumerate() {
            if b.refcnt == 0 {
                b.dev = dev;
                b.blockno = blockno;
                b.refcnt = 1;
                // SAFETY: refcnt was 0, so no Buf or BufUnlocked refers to this
                // slot and nobody holds its sleep-lock; the meta lock keeps it
                // from being claimed concurrently.
                unsafe { (*self.inner[i].get_mut_raw()).valid = false };
                return i;
            }
        }

        panic!("bio: no buffers");
    }

    /// Returns a locked buffer with the contents of the indicated block.
    pub fn read(&'static self, dev: u32, blockno: u32) -> Buf {
        let idx = self.get(dev, blockno);
        let mut guard = self.inner[idx].lock();
        if !guard.valid {
            self.disk(dev).read_block(blockno, &mut guard.data);
            guard.valid = true;
        }
        Buf {
            cache: self,
            idx,
            dev,
            blockno,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Writes the buffer's contents to disk. The caller holds the buffer.
    pub fn write(&self, b: &Buf) {
        self.disk(b.dev).write_block(b.blockno, &b.guard.data);
    }

    fn unpin(&self, idx: usize) {
        let mut meta = self.meta.lock();
        assert!(meta[idx].refcnt >= 1, "bio: unpin of free buffer");
        meta[idx].refcnt -= 1;
    }
}

/// A locked, pinned buffer. Dropping it releases both.
pub struct Buf {
    cache: &'static Bcache,
    idx: usize,
    pub dev: u32,
    pub blockno: u32,
    guard: ManuallyDrop<SleepLockGuard<'static, BufInner>>,
}

impl Buf {
    /// Releases the lock but keeps the slot pinned in the cache.
    /// The log uses this to hold blocks between `write` and commit.
    pub fn unlock(mut self) -> BufUnlocked {
        let unlocked = BufUnlocked {
            cache: self.cache,
            idx: self.idx,
            dev: self.dev,
            blockno: self.blockno,
        };
        // SAFETY: `self` is forgotten below, so the guard is dropped exactly once.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        core::mem::forget(self);
        unlocked
    }
}

impl Deref for Buf {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.data
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // SAFETY: dropped exactly once; `unlock` forgets `self` beforehand.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.cache.unpin(self.idx);
    }
}

/// An unlocked but still pinned buffer.
pub struct BufUnlocked {
    cache: &'static Bcache,
    idx: usize,
    pub dev: u32,
    pub blockno: u32,
}

impl BufUnlocked {
    /// Reacquires the buffer lock; the pin has kept the slot from being
    /// recycled in the meantime.
    pub fn lock(self) -> Buf {
        let guard = self.cache.inner[self.idx].lock();
        debug_assert!(guard.valid);
        let buf = Buf {
            cache: self.cache,
            idx: self.idx,
            dev: self.dev,
            blockno: self.blockno,
            guard: ManuallyDrop::new(guard),
        };
        core::mem::forget(self);
        buf
    }
}

impl Drop for BufUnlocked {
    fn drop(&mut self) {
        self.cache.unpin(self.idx);
    }
}
