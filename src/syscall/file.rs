//! File-system system calls.

use arrayvec::ArrayVec;

use alloc::vec::Vec;

use crate::error::{FsError, Result};
use crate::fs::{FcntlFlags, FileName, InodeGuard, InodeType, Path, RcInode, Tx};
use crate::param::MAXARG;
use crate::pipe::Pipe;

use super::KernelCtx;

impl KernelCtx<'_> {
    /// Creates the inode for `path` with the given type, wiring `.` and `..`
    /// when a directory is created. On success, runs `f` under the new
    /// inode's lock and returns the unlocked inode alongside `f`'s result.
    fn create<T>(
        &mut self,
        path: &Path,
        typ: InodeType,
        major: u16,
        minor: u16,
        tx: &Tx<'_>,
        f: impl FnOnce(&mut InodeGuard<'_>) -> T,
    ) -> Result<(RcInode, T)> {
        let k = self.kernel;
        let (dp, name) = k.itable.nameiparent(k, path, self.proc, tx)?;
        let mut dg = dp.lock();
        let op = dg.op();

        if let Ok(mut de) = op.dirlookup(&mut dg, &name) {
            // The name exists; opening an existing regular file is the only
            // acceptable outcome.
            let found = de.inode.take();
            de.free(tx);
            drop(dg);
            dp.put(tx);
            let ip = found.ok_or(FsError::NotFound)?;
            if typ != InodeType::File {
                ip.put(tx);
                return Err(FsError::AlreadyExists);
            }
            let mut g = ip.lock();
            if matches!(g.typ, InodeType::File | InodeType::Device { .. }) {
                let r = f(&mut g);
                drop(g);
                return Ok((ip, r));
            }
            drop(g);
            ip.put(tx);
            return Err(FsError::AlreadyExists);
        }

        let sb = dp.sb().expect("create: inode without superblock");
        let ip = match op.alloc_inode(sb, tx) {
            Ok(ip) => ip,
            Err(e) => {
                drop(dg);
                dp.put(tx);
                return Err(e);
            }
        };
        let mut g = ip.lock();
        g.nlink = 1;
        g.typ = typ;
        let mut failed = op.create(&mut g, major, minor, tx).is_err();
        if !failed {
            op.write_inode(&mut g, tx);
        }

        if !failed && typ == InodeType::Dir {
            // Entries for "." and "..". No nlink++ for ".": avoid a cyclic
            // link count.
            failed = self
                .dirlink(&mut g, FileName::from_bytes(b"."), &ip, &ip, tx)
                .is_err()
                || self
                    .dirlink(&mut g, FileName::from_bytes(b".."), &dp, &ip, tx)
                    .is_err();
        }

        if !failed {
            failed = self.dirlink(&mut dg, name, &ip, &dp, tx).is_err();
        }

        if failed {
            // Something went wrong; de-allocate ip. The parent has not been
            // touched yet, so nothing there needs undoing.
            g.nlink = 0;
            op.write_inode(&mut g, tx);
            drop(g);
            ip.put(tx);
            drop(dg);
            dp.put(tx);
            return Err(FsError::NoSpace);
        }

        if typ == InodeType::Dir {
            // Success is guaranteed; account the parent's new "..".
            dg.nlink += 1;
            op.write_inode(&mut dg, tx);
        }

        let r = f(&mut g);
        drop(g);
        drop(dg);
        dp.put(tx);
        Ok((ip, r))
    }

    /// Builds a transient dentry for (`name` → `target`) in the directory
    /// locked by `dirg` and writes it through the vtable.
    fn dirlink(
        &self,
        dirg: &mut InodeGuard<'_>,
        name: FileName,
        target: &RcInode,
        parent: &RcInode,
        tx: &Tx<'_>,
    ) -> Result<()> {
        let mut de = self.kernel.dtable.get_blank()?;
        de.op = Some(dirg.op());
        de.name = name;
        de.inode = Some(target.dup());
        de.parent = Some(parent.dup());
        let r = dirg.op().link(dirg, &de, tx);
        de.free(tx);
        r
    }

    pub fn sys_dup(&mut self) -> Result<usize> {
        let fd = self.arg_fd(0)?;
        let f = self.proc.ofile[fd].as_ref().unwrap().dup();
        match self.fdalloc(f) {
            Ok(fd) => Ok(fd),
            Err(f) => {
                f.close();
                Err(FsError::TooManyOpenFiles)
            }
        }
    }

    pub fn sys_read(&mut self) -> Result<usize> {
        let addr = self.arg_addr(1);
        let n = self.arg_int(2);
        let fd = self.arg_fd(0)?;
        if n < 0 {
            return Err(FsError::InvalidArgument);
        }
        let kernel = self.kernel;
        let crate::proc::Proc { ofile, mem, .. } = &mut *self.proc;
        let f = ofile[fd].as_ref().unwrap();
        f.read(kernel, mem, addr, n as usize)
    }

    pub fn sys_write(&mut self) -> Result<usize> {
        let addr = self.arg_addr(1);
        let n = self.arg_int(2);
        let fd = self.arg_fd(0)?;
        if n < 0 {
            return Err(FsError::InvalidArgument);
        }
        let kernel = self.kernel;
        let crate::proc::Proc { ofile, mem, .. } = &mut *self.proc;
        let f = ofile[fd].as_ref().unwrap();
        f.write(kernel, mem, addr, n as usize)
    }

    pub fn sys_close(&mut self) -> Result<usize> {
        let fd = self.arg_fd(0)?;
        let f = self.proc.ofile[fd].take().unwrap();
        f.close();
        Ok(0)
    }

    pub fn sys_fstat(&mut self) -> Result<usize> {
        let addr = self.arg_addr(1);
        let fd = self.arg_fd(0)?;
        let crate::proc::Proc { ofile, mem, .. } = &mut *self.proc;
        let f = ofile[fd].as_ref().unwrap();
        f.stat(mem, addr)?;
        Ok(0)
    }

    /// Creates the path `new` as a link to the same inode as `old`.
    pub fn sys_link(&mut self) -> Result<usize> {
        let old = self.arg_str(0)?;
        let new = self.arg_str(1)?;
        let k = self.kernel;
        let op = k.root_sb().op;
        let tx = op.begin_tx();

        let ip = k.itable.namei(k, Path::from_bytes(&old), self.proc, &tx)?;
        let mut g = ip.lock();
        if g.typ == InodeType::Dir {
            drop(g);
            ip.put(&tx);
            return Err(FsError::IsDirectory);
        }
        g.nlink += 1;
        g.op().write_inode(&mut g, &tx);
        drop(g);

        let mut err = FsError::NotFound;
        if let Ok((dp, name)) = k
            .itable
            .nameiparent(k, Path::from_bytes(&new), self.proc, &tx)
        {
            let mut dg = dp.lock();
            if dp.dev() != ip.dev() {
                err = FsError::InvalidArgument;
            } else {
                match self.dirlink(&mut dg, name, &ip, &dp, &tx) {
                    Ok(()) => {
                        drop(dg);
                        dp.put(&tx);
                        ip.put(&tx);
                        return Ok(0);
                    }
                    Err(e) => err = e,
                }
            }
            drop(dg);
            dp.put(&tx);
        }

        // Undo the link count bump.
        let mut g = ip.lock();
        g.nlink -= 1;
        g.op().write_inode(&mut g, &tx);
        drop(g);
        ip.put(&tx);
        Err(err)
    }

    pub fn sys_unlink(&mut self) -> Result<usize> {
        let path = self.arg_str(0)?;
        let k = self.kernel;
        let op = k.root_sb().op;
        let tx = op.begin_tx();

        let (dp, name) = k
            .itable
            .nameiparent(k, Path::from_bytes(&path), self.proc, &tx)?;
        let mut dg = dp.lock();

        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            drop(dg);
            dp.put(&tx);
            return Err(FsError::InvalidArgument);
        }

        let mut de = match dg.op().dirlookup(&mut dg, &name) {
            Ok(de) => de,
            Err(e) => {
                drop(dg);
                dp.put(&tx);
                return Err(e);
            }
        };
        let ip = de.inode.take().expect("unlink: dentry without inode");
        let mut ig = ip.lock();
        assert!(ig.nlink >= 1, "unlink: nlink < 1");

        if ig.typ == InodeType::Dir && !ig.op().isdirempty(&mut ig) {
            drop(ig);
            ip.put(&tx);
            de.free(&tx);
            drop(dg);
            dp.put(&tx);
            return Err(FsError::DirectoryNotEmpty);
        }

        if let Err(e) = dg.op().unlink(&mut dg, &de, &tx) {
            drop(ig);
            ip.put(&tx);
            de.free(&tx);
            drop(dg);
            dp.put(&tx);
            return Err(e);
        }
        if ig.typ == InodeType::Dir {
            dg.nlink -= 1;
            dg.op().write_inode(&mut dg, &tx);
        }
        de.free(&tx);
        drop(dg);
        dp.put(&tx);

        ig.nlink -= 1;
        ig.op().write_inode(&mut ig, &tx);
        drop(ig);
        ip.put(&tx);
        Ok(0)
    }

    pub fn sys_open(&mut self) -> Result<usize> {
        let omode = FcntlFlags::from_bits_truncate(self.arg_int(1));
        let path = self.arg_str(0)?;
        let k = self.kernel;
        let op = k.root_sb().op;
        let tx = op.begin_tx();

        let (ip, typ) = if omode.contains(FcntlFlags::O_CREATE) {
            self.create(Path::from_bytes(&path), InodeType::File, 0, 0, &tx, |g| {
                g.typ
            })?
        } else {
            let ip = k
                .itable
                .namei(k, Path::from_bytes(&path), self.proc, &tx)?;
            let g = ip.lock();
            let typ = g.typ;
            if typ == InodeType::Dir && omode != FcntlFlags::O_RDONLY {
                drop(g);
                ip.put(&tx);
                return Err(FsError::IsDirectory);
            }
            drop(g);
            (ip, typ)
        };

        if omode.contains(FcntlFlags::O_TRUNC) && typ == InodeType::File {
            let mut g = ip.lock();
            g.op().trunc(&mut g, &tx);
            drop(g);
        }

        let f = match ip.op().open(ip, omode) {
            Ok(f) => f,
            Err((ip, e)) => {
                ip.put(&tx);
                return Err(e);
            }
        };
        match self.fdalloc(f) {
            Ok(fd) => Ok(fd),
            Err(f) => {
                f.close();
                Err(FsError::TooManyOpenFiles)
            }
        }
    }

    pub fn sys_mkdir(&mut self) -> Result<usize> {
        let path = self.arg_str(0)?;
        let op = self.kernel.root_sb().op;
        let tx = op.begin_tx();
        let (ip, ()) = self.create(Path::from_bytes(&path), InodeType::Dir, 0, 0, &tx, |_| ())?;
        ip.put(&tx);
        Ok(0)
    }

    pub fn sys_mknod(&mut self) -> Result<usize> {
        let major = self.arg_int(1) as u16;
        let minor = self.arg_int(2) as u16;
        let path = self.arg_str(0)?;
        let op = self.kernel.root_sb().op;
        let tx = op.begin_tx();
        let (ip, ()) = self.create(
            Path::from_bytes(&path),
            InodeType::Device { major, minor },
            major,
            minor,
            &tx,
            |_| (),
        )?;
        ip.put(&tx);
        Ok(0)
    }

    pub fn sys_chdir(&mut self) -> Result<usize> {
        let path = self.arg_str(0)?;
        let k = self.kernel;
        let op = k.root_sb().op;
        let tx = op.begin_tx();

        let ip = k.itable.namei(k, Path::from_bytes(&path), self.proc, &tx)?;
        let g = ip.lock();
        if g.typ != InodeType::Dir {
            drop(g);
            ip.put(&tx);
            return Err(FsError::NotDirectory);
        }
        drop(g);
        let old = self.proc.cwd.replace(ip);
        if let Some(old) = old {
            old.put(&tx);
        }
        Ok(0)
    }

    pub fn sys_exec(&mut self) -> Result<usize> {
        let path = self.arg_str(0)?;
        let uargv = self.arg_addr(1);

        let mut argv: ArrayVec<Vec<u8>, MAXARG> = ArrayVec::new();
        loop {
            if argv.len() >= MAXARG {
                return Err(FsError::InvalidArgument);
            }
            let uarg = self
                .proc
                .mem
                .fetch_addr(uargv + core::mem::size_of::<usize>() * argv.len())?;
            if uarg == 0 {
                break;
            }
            argv.push(self.proc.mem.fetch_str(uarg, 4096)?);
        }

        let exec = self.kernel.exec().ok_or(FsError::NoDevice)?;
        exec(self, Path::from_bytes(&path), &argv)
    }

    pub fn sys_pipe(&mut self) -> Result<usize> {
        let fdarray = self.arg_addr(0);
        let (rf, wf) = Pipe::alloc(self.kernel)?;

        let fd0 = match self.fdalloc(rf) {
            Ok(fd) => fd,
            Err(rf) => {
                rf.close();
                wf.close();
                return Err(FsError::TooManyOpenFiles);
            }
        };
        let fd1 = match self.fdalloc(wf) {
            Ok(fd) => fd,
            Err(wf) => {
                self.proc.ofile[fd0].take().unwrap().close();
                wf.close();
                return Err(FsError::TooManyOpenFiles);
            }
        };

        let copied = self
            .proc
            .mem
            .copy_out(fdarray, &(fd0 as i32).to_le_bytes())
            .and_then(|()| {
                self.proc
                    .mem
                    .copy_out(fdarray + 4, &(fd1 as i32).to_le_bytes())
            });
        if copied.is_err() {
            self.proc.ofile[fd0].take().unwrap().close();
            self.proc.ofile[fd1].take().unwrap().close();
            return Err(FsError::InvalidArgument);
        }
        Ok(0)
    }
}
