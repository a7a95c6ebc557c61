//! Builds an empty file system image on a block device: boot block,
//! superblock, log, inode blocks, free bitmap, and a root directory holding
//! `.` and `..`. The host-side counterpart of mounting a factory-fresh disk.

use zerocopy::{AsBytes, FromZeroes};

use crate::hal::BlockDevice;
use crate::param::{BSIZE, LOGSIZE};

use super::inode::{Dinode, Dirent, DINODE_SIZE, DIRENT_SIZE};
use super::superblock::{Superblock, BPB, FSMAGIC, IPB};
use super::ROOTINO;
use crate::fs::{FileName, T_DIR};

/// Formats `dev` with `ninodes` disk inodes. Layout, first block to last:
/// boot, superblock, log (header + LOGSIZE blocks), inodes, bitmap, data.
pub fn mkfs(dev: &dyn BlockDevice, ninodes: u32) {
    let size = dev.nblocks();
    let nlog = LOGSIZE as u32 + 1;
    let ninodeblocks = ninodes / IPB as u32 + 1;
    let nbitmap = size / BPB + 1;
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(size > nmeta + 1, "mkfs: device too small");

    let sb = Superblock {
        magic: FSMAGIC,
        size,
        nblocks: size - nmeta,
        ninodes,
        nlog,
        logstart: 2,
        inodestart: 2 + nlog,
        bmapstart: 2 + nlog + ninodeblocks,
    };

    let mut buf = [0u8; BSIZE];
    for bno in 0..size {
        dev.write_block(bno, &buf);
    }

    // Superblock.
    buf[..core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
    dev.write_block(1, &buf);

    // Root directory: inode ROOTINO, one data block with "." and "..".
    let root_block = nmeta;
    let mut dip = Dinode::new_zeroed();
    dip.typ = T_DIR;
    dip.nlink = 1;
    dip.size = (2 * DIRENT_SIZE) as u32;
    dip.addrs[0] = root_block;

    let mut buf = [0u8; BSIZE];
    let off = (ROOTINO as usize % IPB) * DINODE_SIZE;
    buf[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
    dev.write_block(sb.iblock(ROOTINO), &buf);

    let mut buf = [0u8; BSIZE];
    let mut de = Dirent::default();
    de.inum = ROOTINO as u16;
    de.set_name(&FileName::from_bytes(b"."));
    buf[..DIRENT_SIZE].copy_from_slice(de.as_bytes());
    de.set_name(&FileName::from_bytes(b".."));
    buf[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(de.as_bytes());
    dev.write_block(root_block, &buf);

    // Bitmap: metadata blocks plus the root directory's block are in use.
    let used = nmeta + 1;
    assert!(used <= BPB, "mkfs: metadata spans bitmap blocks");
    let mut buf = [0u8; BSIZE];
    for b in 0..used {
        buf[b as usize / 8] |= 1 << (b % 8);
    }
    dev.write_block(sb.bmapstart, &buf);

    log::info!(
        "mkfs: {} blocks total, {} meta, {} data, {} inodes",
        size,
        nmeta,
        sb.nblocks,
        ninodes
    );
}
