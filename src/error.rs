//! Error type for recoverable file-system failures.
//!
//! Recoverable errors surface to the syscall boundary as `-1`; invariant
//! violations (corruption, misuse of the core) panic instead.

/// A recoverable file-system error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path component or directory entry missing.
    NotFound,
    /// Name collision on link/create.
    AlreadyExists,
    /// Path component is not a directory.
    NotDirectory,
    /// Operation not valid on a directory.
    IsDirectory,
    /// Directory still has entries besides `.` and `..`.
    DirectoryNotEmpty,
    /// Bad file descriptor, or wrong open mode for the operation.
    BadFileDescriptor,
    /// Out of file-table slots or per-process descriptors.
    TooManyOpenFiles,
    /// Malformed argument (bad address, oversized path, out-of-range offset).
    InvalidArgument,
    /// No free data block or disk inode.
    NoSpace,
    /// Copy to or from user space failed, or a short device transfer.
    IoError,
    /// No such device, or the device row is not wired.
    NoDevice,
    /// Write on a pipe with no reader.
    BrokenPipe,
}

pub type Result<T> = core::result::Result<T, FsError>;
