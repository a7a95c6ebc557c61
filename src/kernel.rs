//! The kernel-lifetime singletons: buffer cache, inode table, dentry pool,
//! file table, device switch, the file-system-type registry, and the root
//! mount. Built once at boot and threaded everywhere as `&'static Kernel`.

use alloc::boxed::Box;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use spin::Once;

use crate::bio::Bcache;
use crate::error::{FsError, Result};
use crate::file::{Devsw, Ftable};
use crate::fs::{xv6fs, Dtable, FilesystemType, Itable, Path, SuperBlock};
use crate::hal::BlockDevice;
use crate::lock::SpinLock;
use crate::param::{NFSTYPE, ROOTDEV};
use crate::syscall::KernelCtx;

/// The exec entry point the loader registers; `sys_exec` defers to it after
/// marshalling the arguments.
pub type ExecFn = fn(&mut KernelCtx<'_>, &Path, &[Vec<u8>]) -> Result<usize>;

pub struct Kernel {
    pub bcache: Bcache,
    pub itable: Itable,
    pub dtable: Dtable,
    pub ftable: Ftable,
    pub devsw: Devsw,
    fstypes: SpinLock<ArrayVec<&'static FilesystemType, NFSTYPE>>,
    root: Once<SuperBlock>,
    exec: Once<ExecFn>,
}

impl Kernel {
    fn new(disks: impl IntoIterator<Item = (u32, Box<dyn BlockDevice>)>) -> Self {
        Self {
            bcache: Bcache::new(disks),
            itable: Itable::new(),
            dtable: Dtable::new(),
            ftable: Ftable::new(),
            devsw: Devsw::new(),
            fstypes: SpinLock::new("fstypes", ArrayVec::new()),
            root: Once::new(),
            exec: Once::new(),
        }
    }

    /// Adds a file system type to the registry.
    pub fn register_fs(&self, fstype: &'static FilesystemType) {
        let mut types = self.fstypes.lock();
        assert!(
            types.iter().all(|t| t.name != fstype.name),
            "register_fs: duplicate type"
        );
        types.push(fstype);
    }

    pub fn find_fs(&self, name: &str) -> Option<&'static FilesystemType> {
        self.fstypes.lock().iter().copied().find(|t| t.name == name)
    }

    /// Initializes the named file system on the root device and mounts it as
    /// the root of the name space.
    pub fn mount_root(&'static self, typename: &str, source: &str) -> Result<()> {
        let fstype = self.find_fs(typename).ok_or(FsError::NoDevice)?;
        fstype.op.init(self, ROOTDEV)?;
        let sb = fstype.op.mount(fstype, source)?;
        let sb = self.root.call_once(|| sb);
        // The root inode was taken while its superblock was still being
        // built; complete the back-reference now.
        self.itable.attach_sb(&sb.root, sb);
        log::info!("kernel: mounted {} as root", typename);
        Ok(())
    }

    /// The root mount. Panics before `mount_root` has succeeded.
    pub fn root_sb(&'static self) -> &'static SuperBlock {
        self.root.get().expect("kernel: no root file system")
    }

    pub fn try_root_sb(&'static self) -> Option<&'static SuperBlock> {
        self.root.get()
    }

    /// Registers the exec loader.
    pub fn set_exec(&self, f: ExecFn) {
        self.exec.call_once(|| f);
    }

    pub fn exec(&self) -> Option<ExecFn> {
        self.exec.get().copied()
    }
}

/// Brings the file system stack up on `disk`: tables, buffer cache, the
/// xv6fs type, and the root mount. Returns the kernel handle the rest of
/// the API is threaded with.
pub fn boot(disk: Box<dyn BlockDevice>) -> Result<&'static Kernel> {
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new([(ROOTDEV, disk)])));
    kernel.register_fs(xv6fs::new_fstype());
    kernel.mount_root("xv6fs", "disk0")?;
    Ok(kernel)
}
