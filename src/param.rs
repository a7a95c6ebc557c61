/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Cached directory entries per system.
pub const NDENTRY: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Console major device number.
pub const CONSOLE: usize = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block Size.
pub const BSIZE: usize = 512;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Registered file system types.
pub const NFSTYPE: usize = 4;

/// Child mounts per superblock.
pub const MAXMNT: usize = 32;

/// Device path length on a superblock.
pub const DEVSIZ: usize = 32;
