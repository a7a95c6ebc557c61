//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls. The
//! logging system only commits when there are no FS system calls active, so
//! there is never any reasoning required about whether a commit might write
//! an uncommitted system call's updates to disk.
//!
//! A system call brackets its start and end with `begin_op`/`end_op`.
//! Usually `begin_op` just increments the count of in-progress FS system
//! calls and returns; if it thinks the log is close to running out, it waits
//! until the last outstanding `end_op` commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::{Bcache, Buf, BufUnlocked};
use crate::lock::SpinLock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS sys calls are executing?
    outstanding: u32,

    /// In commit(), please wait.
    committing: bool,

    bcache: &'static Bcache,

    /// In-memory mirror of the header block: the blocks pinned in the cache
    /// before commit.
    bufs: ArrayVec<BufUnlocked, LOGSIZE>,
}

/// Contents of the on-disk header block.
#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(core::mem::size_of::<LogHeader>() <= BSIZE);

impl Log {
    pub fn new(bcache: &'static Bcache, dev: u32, start: u32, size: u32) -> Self {
        assert!(
            size as usize > LOGSIZE,
            "log: initlog too small for LOGSIZE"
        );
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            bcache,
            bufs: ArrayVec::new(),
        };
        log.recover_from_log();
        log
    }

    /// Reads the log header from disk into the in-memory log header.
    fn read_head(&mut self) {
        let buf = self.bcache.read(self.dev, self.start);
        let header = LogHeader::read_from_prefix(&buf[..]).unwrap();
        drop(buf);

        for b in &header.block[..header.n as usize] {
            let buf = self.bcache.read(self.dev, *b).unlock();
            self.bufs.push(buf);
        }
    }

    /// Writes the in-memory log header to disk.
    /// This is the true point at which the current transaction commits.
    fn write_head(&mut self) {
        let mut buf = self.bcache.read(self.dev, self.start);
        let mut header = LogHeader::new_zeroed();
        header.n = self.bufs.len() as u32;
        for (db, b) in izip!(&mut header.block, &self.bufs) {
            *db = b.blockno;
        }
        buf[..core::mem::size_of::<LogHeader>()].copy_from_slice(header.as_bytes());
        self.bcache.write(&buf);
    }

    /// Copies committed blocks from the log to their home locations.
    fn install_trans(&mut self) {
        let dev = self.dev;
        let start = self.start;

        for (tail, dbuf) in self.bufs.drain(..).enumerate() {
            let lbuf = self.bcache.read(dev, start + tail as u32 + 1);
            let mut dbuf = dbuf.lock();
            dbuf.copy_from_slice(&lbuf[..]);
            self.bcache.write(&dbuf);
        }
    }

    fn recover_from_log(&mut self) {
        self.read_head();

        // If committed, copy from log to disk.
        self.install_trans();

        // Clear the log.
        self.write_head();
    }

    /// Copies modified blocks from the cache to the log.
    fn write_log(&mut self) {
        for (tail, from) in self.bufs.iter().enumerate() {
            let mut to = self.bcache.read(self.dev, self.start + tail as u32 + 1);
            let from = self.bcache.read(self.dev, from.blockno);
            to.copy_from_slice(&from[..]);
            self.bcache.write(&to);
        }
    }

    fn commit(&mut self) {
        if !self.bufs.is_empty() {
            // Write modified blocks from cache to log.
            self.write_log();

            // Write header to disk -- the real commit.
            self.write_head();

            // Now install writes to home locations.
            self.install_trans();

            // Erase the transaction from the log.
            self.write_head();
        }
    }

    /// The caller has modified `b` and is done with the buffer.
    /// Records the block number and keeps the block pinned in the cache until
    /// commit writes it out. A typical use is:
    ///   let mut bp = bcache.read(...);
    ///   // modify bp data
    ///   log.lock().write(bp);
    pub fn write(&mut self, b: Buf) {
        assert!(
            self.bufs.len() < LOGSIZE && (self.bufs.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "log: write outside of trans");

        if self.bufs.iter().all(|buf| buf.blockno != b.blockno) {
            // Add new block to log; the unlocked buffer keeps the pin.
            self.bufs.push(b.unlock());
        }
    }
}

impl SpinLock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self) {
        loop {
            let mut guard = self.lock();
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.bufs.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                drop(guard);
                core::hint::spin_loop();
            } else {
                guard.outstanding += 1;
                return;
            }
        }
    }

    /// Called at the end of each FS system call.
    /// Commits if this was the last outstanding operation.
    pub fn end_op(&self) {
        let mut guard = self.lock();
        assert!(guard.outstanding >= 1, "log: end_op without begin_op");
        guard.outstanding -= 1;
        assert!(!guard.committing, "log: committing");

        if guard.outstanding == 0 {
            // Since outstanding is 0, no ongoing transaction exists, and
            // committing keeps new ones from starting while the lock is
            // released for the disk writes.
            guard.committing = true;
            guard.reacquire_after(|| {
                // SAFETY: committing is set, so no other task touches the log.
                let log = unsafe { &mut *self.get_mut_raw() };
                log.commit();
            });
            guard.committing = false;
        }
    }
}
