//! End-to-end scenarios driven through the syscall surface.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::setup;
use kvfs::fs::{T_DEVICE, T_DIR, T_FILE};

const O_RDONLY: i32 = 0;
const O_WRONLY: i32 = 0x1;
const O_RDWR: i32 = 0x2;
const O_CREATE: i32 = 0x200;
const O_TRUNC: i32 = 0x400;

#[test]
fn create_read_write_stat() {
    let mut h = setup();

    let fd = h.open("/a", O_CREATE | O_RDWR);
    assert!(fd >= 0);
    assert_eq!(h.write(fd, b"hello"), 5);
    assert_eq!(h.close(fd), 0);

    let fd = h.open("/a", O_RDONLY);
    assert!(fd >= 0);
    let (n, data) = h.read(fd, 5);
    assert_eq!(n, 5);
    assert_eq!(&data, b"hello");

    let st = h.fstat(fd).unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.typ, T_FILE);
    assert_eq!(st.nlink, 1);
    assert_eq!(h.close(fd), 0);
}

#[test]
fn link_and_unlink() {
    let mut h = setup();
    let free0 = h.free_blocks();
    let inodes0 = h.used_inodes();

    let fd = h.open("/x", O_CREATE | O_RDWR);
    assert_eq!(h.write(fd, b"abc"), 3);
    assert_eq!(h.close(fd), 0);

    assert_eq!(h.link("/x", "/y"), 0);
    let fd = h.open("/x", O_RDONLY);
    assert_eq!(h.fstat(fd).unwrap().nlink, 2);
    assert_eq!(h.close(fd), 0);
    let fd = h.open("/y", O_RDONLY);
    assert_eq!(h.fstat(fd).unwrap().nlink, 2);
    assert_eq!(h.close(fd), 0);

    assert_eq!(h.unlink("/x"), 0);
    assert_eq!(h.open("/x", O_RDONLY), -1);

    let fd = h.open("/y", O_RDONLY);
    let (n, data) = h.read(fd, 16);
    assert_eq!(n, 3);
    assert_eq!(&data, b"abc");
    assert_eq!(h.close(fd), 0);

    assert_eq!(h.unlink("/y"), 0);
    assert_eq!(h.free_blocks(), free0);
    assert_eq!(h.used_inodes(), inodes0);
}

#[test]
fn link_to_directory_fails() {
    let mut h = setup();
    assert_eq!(h.mkdir("/d"), 0);
    assert_eq!(h.link("/d", "/e"), -1);
}

#[test]
fn link_name_collision_is_rolled_back() {
    let mut h = setup();
    let fd = h.open("/x", O_CREATE | O_RDWR);
    h.close(fd);
    let fd = h.open("/y", O_CREATE | O_RDWR);
    h.close(fd);

    assert_eq!(h.link("/x", "/y"), -1);
    let fd = h.open("/x", O_RDONLY);
    assert_eq!(h.fstat(fd).unwrap().nlink, 1);
    h.close(fd);
}

#[test]
fn mkdir_and_chdir() {
    let mut h = setup();
    assert_eq!(h.mkdir("/d"), 0);
    assert_eq!(h.chdir("/d"), 0);

    let fd = h.open("q", O_CREATE | O_RDWR);
    assert!(fd >= 0);
    assert_eq!(h.write(fd, b"payload"), 7);
    assert_eq!(h.close(fd), 0);

    assert_eq!(h.chdir("/"), 0);
    let fd = h.open("/d/q", O_RDONLY);
    assert!(fd >= 0);
    let (n, data) = h.read(fd, 16);
    assert_eq!(n, 7);
    assert_eq!(&data, b"payload");
    h.close(fd);

    let fd = h.open("/d", O_RDONLY);
    assert_eq!(h.fstat(fd).unwrap().typ, T_DIR);
    h.close(fd);

    assert_eq!(h.chdir("/d/q"), -1);
    assert_eq!(h.chdir("/nosuch"), -1);
}

#[test]
fn indirect_blocks_round_trip() {
    let mut h = setup();
    let len = kvfs::fs::xv6fs::NDIRECT * kvfs::param::BSIZE + 100;
    let pattern: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();

    let fd = h.open("/big", O_CREATE | O_RDWR);
    assert_eq!(h.write(fd, &pattern), len as i64);
    assert_eq!(h.close(fd), 0);

    let fd = h.open("/big", O_RDONLY);
    let st = h.fstat(fd).unwrap();
    assert_eq!(st.size, len as u64);
    let (n, data) = h.read(fd, len + 100);
    assert_eq!(n, len as i64);
    assert_eq!(data, pattern);
    h.close(fd);
}

#[test]
fn truncate_on_open() {
    let mut h = setup();
    let free0 = h.free_blocks();

    let fd = h.open("/t", O_CREATE | O_RDWR);
    assert_eq!(h.write(fd, &[0x5a; 1000]), 1000);
    assert_eq!(h.close(fd), 0);
    assert!(h.free_blocks() < free0);

    let fd = h.open("/t", O_WRONLY | O_TRUNC);
    assert!(fd >= 0);
    let st = h.fstat(fd).unwrap();
    assert_eq!(st.size, 0);
    assert_eq!(h.close(fd), 0);

    // All data blocks are back in the bitmap; only the empty file remains.
    assert_eq!(h.free_blocks(), free0);
    assert_eq!(h.unlink("/t"), 0);
}

#[test]
fn unlink_non_empty_directory_fails() {
    let mut h = setup();
    assert_eq!(h.mkdir("/e"), 0);
    let fd = h.open("/e/f", O_CREATE | O_RDWR);
    assert!(fd >= 0);
    assert_eq!(h.close(fd), 0);

    assert_eq!(h.unlink("/e"), -1);
    assert_eq!(h.unlink("/e/f"), 0);
    assert_eq!(h.unlink("/e"), 0);
    assert_eq!(h.open("/e", O_RDONLY), -1);
}

#[test]
fn unlink_dot_fails() {
    let mut h = setup();
    assert_eq!(h.mkdir("/e"), 0);
    assert_eq!(h.unlink("/e/."), -1);
    assert_eq!(h.unlink("/e/.."), -1);
}

#[test]
fn directory_name_length_boundary() {
    let mut h = setup();

    // Exactly DIRSIZ (14) bytes round-trips.
    let name14 = "/abcdefghijklmn";
    let fd = h.open(name14, O_CREATE | O_RDWR);
    assert!(fd >= 0);
    assert_eq!(h.write(fd, b"fourteen"), 8);
    h.close(fd);
    let fd = h.open(name14, O_RDONLY);
    assert!(fd >= 0);
    h.close(fd);

    // A fifteenth byte is silently cut, so the long name reaches the same
    // file.
    let fd = h.open("/abcdefghijklmno", O_RDONLY);
    assert!(fd >= 0);
    let (n, data) = h.read(fd, 16);
    assert_eq!(n, 8);
    assert_eq!(&data, b"fourteen");
    h.close(fd);

    // And a file created with an over-long name is found by its truncation.
    let fd = h.open("/zyxwvutsrqponml", O_CREATE | O_RDWR);
    assert!(fd >= 0);
    h.close(fd);
    let fd = h.open("/zyxwvutsrqponm", O_RDONLY);
    assert!(fd >= 0);
    h.close(fd);
}

#[test]
fn dup_shares_one_offset() {
    let mut h = setup();
    let fd = h.open("/o", O_CREATE | O_RDWR);
    let fd2 = h.dup(fd);
    assert!(fd2 >= 0);
    assert_ne!(fd, fd2);

    assert_eq!(h.write(fd, b"aaa"), 3);
    assert_eq!(h.write(fd2, b"bbb"), 3);
    h.close(fd);
    h.close(fd2);

    let fd = h.open("/o", O_RDONLY);
    let (n, data) = h.read(fd, 16);
    assert_eq!(n, 6);
    assert_eq!(&data, b"aaabbb");
    h.close(fd);
}

#[test]
fn descriptor_table_exhaustion() {
    let mut h = setup();
    let fd = h.open("/f", O_CREATE | O_RDWR);
    assert!(fd >= 0);
    let mut fds = vec![fd];
    loop {
        let fd = h.open("/f", O_RDONLY);
        if fd < 0 {
            break;
        }
        fds.push(fd);
    }
    assert_eq!(fds.len(), kvfs::param::NOFILE);
    for fd in fds {
        assert_eq!(h.close(fd), 0);
    }
    // Slots are reusable after close.
    let fd = h.open("/f", O_RDONLY);
    assert!(fd >= 0);
    h.close(fd);
}

#[test]
fn write_to_readonly_fd_fails() {
    let mut h = setup();
    let fd = h.open("/r", O_CREATE | O_RDWR);
    h.close(fd);
    let fd = h.open("/r", O_RDONLY);
    assert_eq!(h.write(fd, b"x"), -1);
    let fd2 = h.open("/r", O_WRONLY);
    assert_eq!(h.read(fd2, 1).0, -1);
    h.close(fd);
    h.close(fd2);
}

#[test]
fn open_directory_for_writing_fails() {
    let mut h = setup();
    assert_eq!(h.mkdir("/d"), 0);
    assert_eq!(h.open("/d", O_RDWR), -1);
    assert_eq!(h.open("/d", O_WRONLY), -1);
    let fd = h.open("/d", O_RDONLY);
    assert!(fd >= 0);
    h.close(fd);
}

#[test]
fn bad_descriptors_are_rejected() {
    let mut h = setup();
    assert_eq!(h.close(7), -1);
    assert_eq!(h.close(-1), -1);
    assert_eq!(h.read(3, 10).0, -1);
    assert_eq!(h.write(3, b"x"), -1);
    assert!(h.fstat(3).is_none());
    assert_eq!(h.dup(3), -1);
}

#[test]
fn pipe_round_trip_and_eof() {
    let mut h = setup();
    let (rfd, wfd) = h.pipe().unwrap();

    assert_eq!(h.write(wfd, b"through the pipe"), 16);
    let (n, data) = h.read(rfd, 16);
    assert_eq!(n, 16);
    assert_eq!(&data, b"through the pipe");

    assert_eq!(h.close(wfd), 0);
    // Writer gone, ring empty: end of file.
    let (n, _) = h.read(rfd, 8);
    assert_eq!(n, 0);
    assert_eq!(h.close(rfd), 0);
}

#[test]
fn pipe_write_without_reader_fails() {
    let mut h = setup();
    let (rfd, wfd) = h.pipe().unwrap();
    assert_eq!(h.close(rfd), 0);
    assert_eq!(h.write(wfd, b"nobody listens"), -1);
    assert_eq!(h.close(wfd), 0);
}

static DEV_WRITES: AtomicUsize = AtomicUsize::new(0);

fn test_dev_read(
    _k: &'static kvfs::Kernel,
    mem: &mut kvfs::proc::UserMemory,
    addr: usize,
    n: usize,
) -> kvfs::Result<usize> {
    for i in 0..n {
        mem.copy_out(addr + i, &[b'z'])?;
    }
    Ok(n)
}

fn test_dev_write(
    _k: &'static kvfs::Kernel,
    _mem: &mut kvfs::proc::UserMemory,
    _addr: usize,
    n: usize,
) -> kvfs::Result<usize> {
    DEV_WRITES.fetch_add(n, Ordering::SeqCst);
    Ok(n)
}

#[test]
fn device_files_dispatch_by_major() {
    let mut h = setup();
    h.kernel
        .devsw
        .set(kvfs::param::CONSOLE, Some(test_dev_read), Some(test_dev_write));

    assert_eq!(h.mknod("/dev-tty", kvfs::param::CONSOLE as i32, 0), 0);
    let fd = h.open("/dev-tty", O_RDWR);
    assert!(fd >= 0);
    let st = h.fstat(fd).unwrap();
    assert_eq!(st.typ, T_DEVICE);

    let (n, data) = h.read(fd, 4);
    assert_eq!(n, 4);
    assert_eq!(&data, b"zzzz");
    assert_eq!(h.write(fd, b"log line"), 8);
    assert!(DEV_WRITES.load(Ordering::SeqCst) >= 8);
    h.close(fd);

    // An unwired major cannot be opened.
    assert_eq!(h.mknod("/dev-null", 5, 0), 0);
    assert_eq!(h.open("/dev-null", O_RDONLY), -1);
}

#[test]
fn mknod_then_unlink() {
    let mut h = setup();
    assert_eq!(h.mknod("/node", 3, 9), 0);
    assert_eq!(h.unlink("/node"), 0);
    assert_eq!(h.open("/node", O_RDONLY), -1);
}

fn fake_loader(
    _ctx: &mut kvfs::syscall::KernelCtx<'_>,
    path: &kvfs::fs::Path,
    argv: &[Vec<u8>],
) -> kvfs::Result<usize> {
    assert_eq!(path.as_bytes(), b"/bin/prog");
    assert_eq!(argv.len(), 2);
    assert_eq!(argv[0], b"prog");
    assert_eq!(argv[1], b"arg1");
    Ok(argv.len())
}

#[test]
fn exec_marshals_argv() {
    let mut h = setup();
    h.kernel.set_exec(fake_loader);

    // argv strings and the pointer vector, laid out in user memory.
    h.put_str(0x2000, "prog");
    h.put_str(0x2010, "arg1");
    let ptrs: Vec<u8> = [0x2000usize, 0x2010, 0]
        .iter()
        .flat_map(|p| p.to_le_bytes())
        .collect();
    h.proc.mem.copy_out(0x2100, &ptrs).unwrap();
    h.put_str(common::PATH0, "/bin/prog");
    h.proc.frame = [common::PATH0, 0x2100, 0, 0, 0, 0];
    let r = kvfs::syscall::into_ret(h.ctx().sys_exec());
    assert_eq!(r, 2);
}

#[test]
fn exec_without_loader_fails() {
    let mut h = setup();
    h.put_str(common::PATH0, "/bin/prog");
    let ptrs: Vec<u8> = 0usize.to_le_bytes().to_vec();
    h.proc.mem.copy_out(0x2100, &ptrs).unwrap();
    h.proc.frame = [common::PATH0, 0x2100, 0, 0, 0, 0];
    assert_eq!(kvfs::syscall::into_ret(h.ctx().sys_exec()), -1);
}
