//! Property-style checks of the file system core: allocation accounting,
//! lookup idempotence, durability across a remount, and concurrent use.

mod common;

use std::sync::Arc;

use common::{setup, setup_with};
use kvfs::hal::MemDisk;
use kvfs::kernel::boot;
use kvfs::param::BSIZE;
use kvfs::proc::Proc;

const O_RDONLY: i32 = 0;
const O_RDWR: i32 = 0x2;
const O_CREATE: i32 = 0x200;

#[test]
fn write_in_pieces_equals_one_write() {
    let mut h = setup();
    let payload: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();

    let fd = h.open("/piecewise", O_CREATE | O_RDWR);
    for chunk in payload.chunks(700) {
        assert_eq!(h.write(fd, chunk), chunk.len() as i64);
    }
    h.close(fd);

    let fd = h.open("/whole", O_CREATE | O_RDWR);
    assert_eq!(h.write(fd, &payload), payload.len() as i64);
    h.close(fd);

    let fd = h.open("/piecewise", O_RDONLY);
    let (n, a) = h.read(fd, payload.len());
    h.close(fd);
    let fd = h.open("/whole", O_RDONLY);
    let (m, b) = h.read(fd, payload.len());
    h.close(fd);

    assert_eq!(n, payload.len() as i64);
    assert_eq!(n, m);
    assert_eq!(a, b);
    assert_eq!(a, payload);
}

#[test]
fn lookup_is_idempotent() {
    let mut h = setup();
    let fd = h.open("/stable", O_CREATE | O_RDWR);
    h.close(fd);

    let fd1 = h.open("/stable", O_RDONLY);
    let fd2 = h.open("/stable", O_RDONLY);
    let st1 = h.fstat(fd1).unwrap();
    let st2 = h.fstat(fd2).unwrap();
    assert_eq!(st1.ino, st2.ino);
    assert_eq!(st1.dev, st2.dev);
    h.close(fd1);
    h.close(fd2);
}

#[test]
fn reading_does_not_allocate() {
    let mut h = setup();
    let fd = h.open("/ro", O_CREATE | O_RDWR);
    assert_eq!(h.write(fd, &[7u8; 2 * BSIZE]), (2 * BSIZE) as i64);
    h.close(fd);

    let free = h.free_blocks();
    let fd = h.open("/ro", O_RDONLY);
    let (n, _) = h.read(fd, 2 * BSIZE);
    assert_eq!(n, (2 * BSIZE) as i64);
    h.close(fd);
    assert_eq!(h.free_blocks(), free);
}

#[test]
fn data_survives_a_remount() {
    let payload = b"written before the remount";
    let disk: Arc<MemDisk>;
    {
        let mut h = setup();
        let fd = h.open("/persist", O_CREATE | O_RDWR);
        assert_eq!(h.write(fd, payload), payload.len() as i64);
        h.close(fd);
        disk = h.disk.clone();
    }

    // A second kernel on a copy of the device plays the log forward and
    // finds the file.
    let kernel = boot(disk.snapshot()).expect("reboot");
    let mut h = common::Harness {
        kernel,
        disk,
        proc: Proc::new(kernel, common::UMEM),
    };
    let fd = h.open("/persist", O_RDONLY);
    assert!(fd >= 0);
    let (n, data) = h.read(fd, payload.len());
    assert_eq!(n, payload.len() as i64);
    assert_eq!(&data, payload);
    h.close(fd);
}

#[test]
fn deep_paths_resolve() {
    let mut h = setup();
    assert_eq!(h.mkdir("/a"), 0);
    assert_eq!(h.mkdir("/a/b"), 0);
    assert_eq!(h.mkdir("/a/b/c"), 0);
    let fd = h.open("/a/b/c/leaf", O_CREATE | O_RDWR);
    assert_eq!(h.write(fd, b"deep"), 4);
    h.close(fd);

    // Slashes collapse and trailing slashes are ignored.
    let fd = h.open("//a///b/c//leaf", O_RDONLY);
    assert!(fd >= 0);
    let (n, data) = h.read(fd, 8);
    assert_eq!(n, 4);
    assert_eq!(&data, b"deep");
    h.close(fd);

    // A file used as an intermediate component fails cleanly.
    assert_eq!(h.open("/a/b/c/leaf/x", O_RDONLY), -1);
}

#[test]
fn dot_and_dotdot_resolve() {
    let mut h = setup();
    assert_eq!(h.mkdir("/d"), 0);
    let fd = h.open("/d/./f", O_CREATE | O_RDWR);
    assert_eq!(h.write(fd, b"dot"), 3);
    h.close(fd);

    let fd = h.open("/d/../d/f", O_RDONLY);
    assert!(fd >= 0);
    let (n, data) = h.read(fd, 8);
    assert_eq!(n, 3);
    assert_eq!(&data, b"dot");
    h.close(fd);

    assert_eq!(h.chdir("/d"), 0);
    let fd = h.open("./f", O_RDONLY);
    assert!(fd >= 0);
    h.close(fd);
    let fd = h.open("../d/f", O_RDONLY);
    assert!(fd >= 0);
    h.close(fd);
}

#[test]
fn many_files_in_one_directory() {
    let mut h = setup_with(4000, 300);
    assert_eq!(h.mkdir("/many"), 0);
    for i in 0..50 {
        let path = format!("/many/f{i}");
        let fd = h.open(&path, O_CREATE | O_RDWR);
        assert!(fd >= 0, "create {path}");
        assert_eq!(h.write(fd, path.as_bytes()), path.len() as i64);
        h.close(fd);
    }
    for i in 0..50 {
        let path = format!("/many/f{i}");
        let fd = h.open(&path, O_RDONLY);
        assert!(fd >= 0, "open {path}");
        let (n, data) = h.read(fd, 32);
        assert_eq!(n, path.len() as i64);
        assert_eq!(data, path.as_bytes());
        h.close(fd);
    }
    for i in 0..50 {
        assert_eq!(h.unlink(&format!("/many/f{i}")), 0);
    }
    assert_eq!(h.unlink("/many"), 0);
}

#[test]
fn concurrent_processes_share_the_tree() {
    let h = setup_with(4000, 300);
    let kernel = h.kernel;

    let workers: Vec<_> = (0..4)
        .map(|w| {
            std::thread::spawn(move || {
                let mut h = common::Harness {
                    kernel,
                    disk: Arc::new(MemDisk::new(1)),
                    proc: Proc::new(kernel, common::UMEM),
                };
                for i in 0..10 {
                    let path = format!("/w{w}-{i}");
                    let fd = h.open(&path, O_CREATE | O_RDWR);
                    assert!(fd >= 0);
                    assert_eq!(h.write(fd, path.as_bytes()), path.len() as i64);
                    h.close(fd);

                    let fd = h.open(&path, O_RDONLY);
                    let (n, data) = h.read(fd, 32);
                    assert_eq!(n, path.len() as i64);
                    assert_eq!(data, path.as_bytes());
                    h.close(fd);

                    assert_eq!(h.unlink(&path), 0);
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
}
