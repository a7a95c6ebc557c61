//! On-disk inodes, their content mapping, and directories.
//!
//! The inode disk structure holds metadata: the file's type, its size, the
//! number of links referring to it, and the list of blocks holding the
//! file's content. Inodes are laid out sequentially on disk at
//! `superblock.inodestart`; each inode has a number indicating its position.
//!
//! The content (data) associated with each inode is stored in blocks on the
//! disk. The first NDIRECT block numbers are listed in `addrs`; the next
//! NINDIRECT blocks are listed in the block `addrs[NDIRECT]`.

use alloc::boxed::Box;
use core::cmp;
use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::Buf;
use crate::error::{FsError, Result};
use crate::fs::{FileName, FilesystemOps, InodeGuard, InodeType, RcInode, Tx, DIRSIZ};
use crate::param::BSIZE;

use super::superblock::IPB;
use super::Xv6fs;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// On-disk inode structure.
#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Dinode {
    /// File type; 0 marks a free inode
    pub typ: i16,

    /// Major device number (device files only)
    pub major: i16,

    /// Minor device number (device files only)
    pub minor: i16,

    /// Number of links to inode in file system
    pub nlink: i16,

    /// Size of file (bytes)
    pub size: u32,

    /// Data block addresses; the last entry points at the indirect block
    pub addrs: [u32; NDIRECT + 1],
}

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();

const_assert!(IPB * DINODE_SIZE <= BSIZE);

/// FS-private payload hung off an in-memory inode.
pub struct Xv6Inode {
    pub major: u16,
    pub minor: u16,
    pub addrs: [u32; NDIRECT + 1],
}

/// A directory is a file containing a sequence of Dirent structures.
#[derive(Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Dirent {
    /// Referenced inode number; 0 marks a free entry
    pub inum: u16,
    name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

impl Dirent {
    /// Fills in the name, zero-padded to DIRSIZ bytes.
    pub fn set_name(&mut self, name: &FileName) {
        let bytes = name.as_bytes();
        self.name = [0; DIRSIZ];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    /// The stored name, without the zero padding.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }
}

pub(super) fn read_dinode(bp: &Buf, inum: u32) -> Dinode {
    let off = (inum as usize % IPB) * DINODE_SIZE;
    Dinode::read_from_prefix(&bp[off..]).unwrap()
}

pub(super) fn write_dinode(bp: &mut Buf, inum: u32, dip: &Dinode) {
    let off = (inum as usize % IPB) * DINODE_SIZE;
    bp[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
}

fn indirect_entry(bp: &Buf, i: usize) -> u32 {
    u32::from_le_bytes(bp[i * 4..i * 4 + 4].try_into().unwrap())
}

fn set_indirect_entry(bp: &mut Buf, i: usize, addr: u32) {
    bp[i * 4..i * 4 + 4].copy_from_slice(&addr.to_le_bytes());
}

fn payload<'a>(guard: &'a InodeGuard<'_>) -> &'a Xv6Inode {
    guard
        .private
        .as_ref()
        .expect("xv6fs: inode not loaded")
        .downcast_ref()
        .expect("xv6fs: foreign inode payload")
}

fn payload_mut<'a>(guard: &'a mut InodeGuard<'_>) -> &'a mut Xv6Inode {
    guard
        .private
        .as_mut()
        .expect("xv6fs: inode not loaded")
        .downcast_mut()
        .expect("xv6fs: foreign inode payload")
}

impl Xv6fs {
    /// Allocates an inode in the on-disk table.
    ///
    /// The claimed slot is stamped with a nonzero type immediately, so a
    /// crash between the claim and `create` leaves no half-free inode;
    /// `create` writes the real type. Returns an unlocked but allocated and
    /// referenced inode.
    pub(super) fn ialloc(&'static self, tx: &Tx<'_>) -> Result<RcInode> {
        let dev = self.dev();
        let sb = self.superblock();
        for inum in 1..sb.ninodes {
            let mut bp = self.bcache().read(dev, sb.iblock(inum));
            let dip = read_dinode(&bp, inum);
            if dip.typ == 0 {
                // A free inode: claim it.
                let mut dip = Dinode::new_zeroed();
                dip.typ = crate::fs::T_FILE; // claim mark; create() writes the real type
                write_dinode(&mut bp, inum, &dip);
                self.log_write(bp, tx);
                return self.geti(dev, inum);
            }
        }
        log::warn!("ialloc: no inodes");
        Err(FsError::NoSpace)
    }

    /// Copies a modified in-memory inode to disk.
    /// Must be called after every change to a field that lives on disk.
    /// The caller holds the inode lock.
    pub(super) fn iupdate(&'static self, guard: &mut InodeGuard<'_>, tx: &Tx<'_>) {
        let mut dip = Dinode::new_zeroed();
        dip.nlink = guard.nlink;
        dip.size = guard.size;
        match guard.typ {
            InodeType::None => dip.typ = 0,
            InodeType::Dir => dip.typ = crate::fs::T_DIR,
            InodeType::File => dip.typ = crate::fs::T_FILE,
            InodeType::Device { major, minor } => {
                dip.typ = crate::fs::T_DEVICE;
                dip.major = major as i16;
                dip.minor = minor as i16;
            }
        }
        let ip = payload(guard);
        dip.addrs = ip.addrs;

        let sb = self.superblock();
        let mut bp = self.bcache().read(guard.dev(), sb.iblock(guard.inum()));
        write_dinode(&mut bp, guard.inum(), &dip);
        self.log_write(bp, tx);
    }

    /// Populates an inode whose metadata has not been read yet.
    /// The caller holds the inode lock.
    pub(super) fn load_inode(&'static self, guard: &mut InodeGuard<'_>) {
        let sb = self.superblock();
        let bp = self.bcache().read(guard.dev(), sb.iblock(guard.inum()));
        let dip = read_dinode(&bp, guard.inum());
        drop(bp);

        guard.typ = match dip.typ {
            0 => InodeType::None,
            crate::fs::T_DIR => InodeType::Dir,
            crate::fs::T_FILE => InodeType::File,
            crate::fs::T_DEVICE => InodeType::Device {
                major: dip.major as u16,
                minor: dip.minor as u16,
            },
            t => panic!("xv6fs: bad inode type {}", t),
        };
        guard.nlink = dip.nlink;
        guard.size = dip.size;
        guard.private = Some(Box::new(Xv6Inode {
            major: dip.major as u16,
            minor: dip.minor as u16,
            addrs: dip.addrs,
        }));
    }

    /// Returns the disk block address of the `bn`th block in the inode, or
    /// `None` if no block has been allocated there. Never allocates, so the
    /// read path leaves holes alone.
    pub(super) fn bmap_read(&'static self, guard: &mut InodeGuard<'_>, bn: usize) -> Option<u32> {
        if bn < NDIRECT {
            let addr = payload(guard).addrs[bn];
            return (addr != 0).then_some(addr);
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");

        let indirect = payload(guard).addrs[NDIRECT];
        if indirect == 0 {
            return None;
        }
        let bp = self.bcache().read(guard.dev(), indirect);
        let addr = indirect_entry(&bp, bn);
        (addr != 0).then_some(addr)
    }

    /// Returns the disk block address of the `bn`th block in the inode,
    /// allocating it (and the indirect block) if needed.
    pub(super) fn bmap_or_alloc(
        &'static self,
        guard: &mut InodeGuard<'_>,
        bn: usize,
        tx: &Tx<'_>,
    ) -> Result<u32> {
        let dev = guard.dev();
        if bn < NDIRECT {
            let mut addr = payload(guard).addrs[bn];
            if addr == 0 {
                addr = self.balloc(dev, tx)?;
                payload_mut(guard).addrs[bn] = addr;
            }
            return Ok(addr);
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");

        // Load the indirect block, allocating if necessary.
        let mut indirect = payload(guard).addrs[NDIRECT];
        if indirect == 0 {
            indirect = self.balloc(dev, tx)?;
            payload_mut(guard).addrs[NDIRECT] = indirect;
        }
        let mut bp = self.bcache().read(dev, indirect);
        let mut addr = indirect_entry(&bp, bn);
        if addr == 0 {
            addr = self.balloc(dev, tx)?;
            set_indirect_entry(&mut bp, bn, addr);
            self.log_write(bp, tx);
        }
        Ok(addr)
    }

    /// Truncates the inode (discards its contents).
    /// The caller holds the inode lock.
    pub(super) fn itrunc(&'static self, guard: &mut InodeGuard<'_>, tx: &Tx<'_>) {
        let dev = guard.dev();
        for i in 0..NDIRECT {
            let addr = payload(guard).addrs[i];
            if addr != 0 {
                self.bfree(dev, addr, tx);
                payload_mut(guard).addrs[i] = 0;
            }
        }

        let indirect = payload(guard).addrs[NDIRECT];
        if indirect != 0 {
            let bp = self.bcache().read(dev, indirect);
            for j in 0..NINDIRECT {
                let addr = indirect_entry(&bp, j);
                if addr != 0 {
                    self.bfree(dev, addr, tx);
                }
            }
            drop(bp);
            self.bfree(dev, indirect, tx);
            payload_mut(guard).addrs[NDIRECT] = 0;
        }

        guard.size = 0;
        self.iupdate(guard, tx);
    }

    /// Reads data from the inode into `sink`. The caller holds the inode
    /// lock. A window with no mapped block is delivered as zeroes; the read
    /// path never allocates.
    pub(super) fn readi(
        &'static self,
        guard: &mut InodeGuard<'_>,
        mut off: u32,
        mut n: u32,
        sink: &mut dyn FnMut(u32, &[u8]) -> Result<()>,
    ) -> Result<usize> {
        if off > guard.size || off.checked_add(n).is_none() {
            return Ok(0);
        }
        if off + n > guard.size {
            n = guard.size - off;
        }

        const ZEROES: [u8; BSIZE] = [0; BSIZE];
        let mut tot: u32 = 0;
        while tot < n {
            let begin = (off % BSIZE as u32) as usize;
            let m = cmp::min(n - tot, (BSIZE - begin) as u32);
            let res = match self.bmap_read(guard, (off as usize) / BSIZE) {
                Some(addr) => {
                    let bp = self.bcache().read(guard.dev(), addr);
                    sink(tot, &bp[begin..begin + m as usize])
                }
                None => sink(tot, &ZEROES[..m as usize]),
            };
            if res.is_err() {
                return Err(FsError::IoError);
            }
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Writes data from `src` into the inode. The caller holds the inode
    /// lock. Returns the number of bytes written; fewer than `n` means a
    /// block could not be allocated or the source failed.
    pub(super) fn writei(
        &'static self,
        guard: &mut InodeGuard<'_>,
        off: u32,
        n: u32,
        src: &mut dyn FnMut(u32, &mut [u8]) -> Result<()>,
        tx: &Tx<'_>,
    ) -> Result<usize> {
        if off > guard.size || off.checked_add(n).is_none() {
            return Err(FsError::InvalidArgument);
        }
        if (off + n) as usize > MAXFILE * BSIZE {
            return Err(FsError::InvalidArgument);
        }

        let mut tot: u32 = 0;
        while tot < n {
            let cur = off + tot;
            let addr = match self.bmap_or_alloc(guard, (cur as usize) / BSIZE, tx) {
                Ok(addr) => addr,
                Err(_) => break,
            };
            let begin = (cur % BSIZE as u32) as usize;
            let m = cmp::min(n - tot, (BSIZE - begin) as u32);
            let mut bp = self.bcache().read(guard.dev(), addr);
            if src(tot, &mut bp[begin..begin + m as usize]).is_err() {
                break;
            }
            self.log_write(bp, tx);
            tot += m;
        }

        if off + tot > guard.size {
            guard.size = off + tot;
        }

        // Write the inode back to disk even if the size didn't change,
        // because the loop above might have called bmap_or_alloc and added a
        // new block to addrs.
        self.iupdate(guard, tx);

        Ok(tot as usize)
    }

    /// Reads a fixed-size record out of the inode's content.
    pub(super) fn read_kernel<T: AsBytes + FromBytes + FromZeroes>(
        &'static self,
        guard: &mut InodeGuard<'_>,
        off: u32,
    ) -> Result<T> {
        let mut val = T::new_zeroed();
        let n = self.readi(guard, off, mem::size_of::<T>() as u32, &mut |o, src| {
            val.as_bytes_mut()[o as usize..o as usize + src.len()].copy_from_slice(src);
            Ok(())
        })?;
        if n == mem::size_of::<T>() {
            Ok(val)
        } else {
            Err(FsError::IoError)
        }
    }

    /// Writes a fixed-size record into the inode's content.
    pub(super) fn write_kernel<T: AsBytes>(
        &'static self,
        guard: &mut InodeGuard<'_>,
        val: &T,
        off: u32,
        tx: &Tx<'_>,
    ) -> Result<()> {
        let bytes = val.as_bytes();
        let n = self.writei(
            guard,
            off,
            bytes.len() as u32,
            &mut |o, dst| {
                dst.copy_from_slice(&bytes[o as usize..o as usize + dst.len()]);
                Ok(())
            },
            tx,
        )?;
        if n == bytes.len() {
            Ok(())
        } else {
            Err(FsError::IoError)
        }
    }

    /// Looks for a directory entry named `name` in `dp`.
    pub(super) fn lookup_entry(
        &'static self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
    ) -> Result<(u32, u32)> {
        assert_eq!(dp.typ, InodeType::Dir, "dirlookup not DIR");

        for off in (0..dp.size).step_by(DIRENT_SIZE) {
            let de: Dirent = self
                .read_kernel(dp, off)
                .expect("dirlookup read");
            if de.inum == 0 {
                continue;
            }
            if de.name_bytes() == name.as_bytes() {
                // Entry matches path element.
                return Ok((de.inum as u32, off));
            }
        }
        Err(FsError::NotFound)
    }

    /// Writes a new directory entry (`name` → `inum`) into `dp`, reusing the
    /// first free slot or appending.
    pub(super) fn dirlink(
        &'static self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
        inum: u32,
        tx: &Tx<'_>,
    ) -> Result<()> {
        // Check that the name is not present.
        if self.lookup_entry(dp, name).is_ok() {
            return Err(FsError::AlreadyExists);
        }

        // Look for an empty dirent.
        let mut off = dp.size;
        for o in (0..dp.size).step_by(DIRENT_SIZE) {
            let de: Dirent = self.read_kernel(dp, o).expect("dirlink read");
            if de.inum == 0 {
                off = o;
                break;
            }
        }

        let mut de = Dirent::default();
        de.inum = inum as u16;
        de.set_name(name);
        self.write_kernel(dp, &de, off, tx)
    }

    /// Is the directory empty except for `.` and `..`?
    pub(super) fn dir_is_empty(&'static self, dp: &mut InodeGuard<'_>) -> bool {
        for off in (2 * DIRENT_SIZE as u32..dp.size).step_by(DIRENT_SIZE) {
            let de: Dirent = self.read_kernel(dp, off).expect("isdirempty: readi");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}
