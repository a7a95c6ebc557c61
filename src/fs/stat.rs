use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Directory.
pub const T_DIR: i16 = 1;
/// Regular file.
pub const T_FILE: i16 = 2;
/// Device file.
pub const T_DEVICE: i16 = 3;

#[derive(Copy, Clone, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Stat {
    /// File system's disk device
    pub dev: u32,

    /// Inode number
    pub ino: u32,

    /// Type of file
    pub typ: i16,

    /// Number of links to file
    pub nlink: i16,

    /// Padding for safely serializing the struct
    pub _padding: u32,

    /// Size of file in bytes
    pub size: u64,
}
