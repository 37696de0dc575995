mod common;

use common::*;
use rvpk::syscalls::{
    SYS_CCWD, SYS_CLOSE, SYS_CLOSEDIR, SYS_LINK, SYS_LSEEK, SYS_MKDIR, SYS_OPEN, SYS_OPENDIR,
    SYS_RCWD, SYS_READ, SYS_READDIR, SYS_STAT, SYS_UNLINK, SYS_WRITE,
};
use rvpk::vfs::{SEEK_END, SEEK_SET};

struct Fixture {
    kernel: rvpk::Kernel,
    hart: rvpk::scheduler::HartContext,
    pid: u32,
    sp: u64,
}

impl Fixture {
    fn new() -> Fixture {
        let (kernel, hart, pid) = boot(simple_image());
        kernel.register_program("/data/notes.txt", b"hello file".to_vec());
        let sp = kernel.trapframe(pid).unwrap().regs.sp;
        Fixture { kernel, hart, pid, sp }
    }

    /// Stage a path string and return its address.
    fn path(&self, s: &str) -> u64 {
        let va = self.sp - 256;
        stage_cstr(&self.kernel, self.pid, va, s);
        va
    }

    /// A second staging slot for two-path syscalls and read buffers.
    fn buf(&self) -> u64 {
        self.sp - 512
    }

    fn call(&mut self, nr: u64, args: &[u64]) -> i64 {
        self.kernel.syscall(&mut self.hart, nr, args).unwrap().0
    }
}

#[test]
fn open_read_seek_stat_close() {
    let mut fx = Fixture::new();
    let path = fx.path("/data/notes.txt");
    let fd = fx.call(SYS_OPEN, &[path]);
    assert_eq!(fd, 3); // 0-2 are the console
    let fd = fd as u64;

    let buf = fx.buf();
    assert_eq!(fx.call(SYS_READ, &[fd, buf, 5]), 5);
    assert_eq!(fx.kernel.read_user(fx.pid, buf, 5).unwrap(), b"hello");

    assert_eq!(fx.call(SYS_LSEEK, &[fd, 6, SEEK_SET]), 6);
    assert_eq!(fx.call(SYS_READ, &[fd, buf, 16]), 4); // short read at EOF
    assert_eq!(fx.kernel.read_user(fx.pid, buf, 4).unwrap(), b"file");
    assert_eq!(fx.call(SYS_LSEEK, &[fd, 0, SEEK_END]), 10);

    let stat = fx.buf() + 64;
    assert_eq!(fx.call(SYS_STAT, &[fd, stat]), 0);
    let size = fx.kernel.read_user(fx.pid, stat, 8).unwrap();
    assert_eq!(u64::from_le_bytes(size.try_into().unwrap()), 10);

    assert_eq!(fx.call(SYS_CLOSE, &[fd]), 0);
    assert_eq!(fx.call(SYS_READ, &[fd, buf, 1]), -1);
}

#[test]
fn open_of_a_missing_path_returns_minus_one() {
    let mut fx = Fixture::new();
    let path = fx.path("/data/absent");
    assert_eq!(fx.call(SYS_OPEN, &[path]), -1);
}

#[test]
fn writes_to_the_console_descriptors_print() {
    let mut fx = Fixture::new();
    let va = fx.buf();
    fx.kernel.write_user(fx.pid, va, b"to stdout").unwrap();
    fx.kernel.drain_console();
    assert_eq!(fx.call(SYS_WRITE, &[1, va, 9]), 9);
    assert_eq!(fx.kernel.drain_console(), "to stdout");
}

#[test]
fn host_files_are_read_only() {
    let mut fx = Fixture::new();
    let path = fx.path("/data/notes.txt");
    let fd = fx.call(SYS_OPEN, &[path]) as u64;
    let va = fx.buf();
    fx.kernel.write_user(fx.pid, va, b"nope").unwrap();
    assert_eq!(fx.call(SYS_WRITE, &[fd, va, 4]), -1);
}

#[test]
fn readdir_walks_a_directory_once() {
    let mut fx = Fixture::new();
    fx.kernel.register_program("/bin/extra", b"x".to_vec());
    let path = fx.path("/bin");
    let fd = fx.call(SYS_OPENDIR, &[path]) as u64;
    let buf = fx.buf();

    assert_eq!(fx.call(SYS_READDIR, &[fd, buf]), 3);
    assert_eq!(fx.kernel.read_user(fx.pid, buf, 4).unwrap(), b"app\0");
    assert_eq!(fx.call(SYS_READDIR, &[fd, buf]), 5);
    assert_eq!(fx.kernel.read_user(fx.pid, buf, 6).unwrap(), b"extra\0");
    assert_eq!(fx.call(SYS_READDIR, &[fd, buf]), -1);
    assert_eq!(fx.call(SYS_CLOSEDIR, &[fd]), 0);
}

#[test]
fn opendir_of_a_file_or_missing_path_fails() {
    let mut fx = Fixture::new();
    let path = fx.path("/data/notes.txt");
    assert_eq!(fx.call(SYS_OPENDIR, &[path]), -1);
    let path = fx.path("/nowhere");
    assert_eq!(fx.call(SYS_OPENDIR, &[path]), -1);
}

#[test]
fn mkdir_ccwd_and_rcwd_round_trip() {
    let mut fx = Fixture::new();
    let path = fx.path("/tmp");
    assert_eq!(fx.call(SYS_MKDIR, &[path]), 0);
    assert_eq!(fx.call(SYS_CCWD, &[path]), 0);

    let buf = fx.buf();
    assert_eq!(fx.call(SYS_RCWD, &[buf]), 0);
    assert_eq!(fx.kernel.read_user(fx.pid, buf, 5).unwrap(), b"/tmp\0");

    let path = fx.path("/missing");
    assert_eq!(fx.call(SYS_CCWD, &[path]), -1);
}

#[test]
fn relative_paths_resolve_against_the_cwd() {
    let mut fx = Fixture::new();
    let path = fx.path("/data");
    assert_eq!(fx.call(SYS_CCWD, &[path]), 0);
    let path = fx.path("notes.txt");
    let fd = fx.call(SYS_OPEN, &[path]);
    assert!(fd >= 3);
}

#[test]
fn link_gives_a_second_name_and_unlink_takes_one_away() {
    let mut fx = Fixture::new();
    let from = fx.path("/data/notes.txt");
    let to = fx.buf();
    stage_cstr(&fx.kernel, fx.pid, to, "/data/alias");
    assert_eq!(fx.call(SYS_LINK, &[from, to]), 0);

    let path = fx.path("/data/alias");
    assert!(fx.call(SYS_OPEN, &[path]) >= 3);

    let path = fx.path("/data/notes.txt");
    assert_eq!(fx.call(SYS_UNLINK, &[path]), 0);
    assert_eq!(fx.call(SYS_OPEN, &[path]), -1);
    // the alias still reads the shared bytes
    let path = fx.path("/data/alias");
    let fd = fx.call(SYS_OPEN, &[path]) as u64;
    let buf = fx.buf() + 64;
    assert_eq!(fx.call(SYS_READ, &[fd, buf, 10]), 10);
    assert_eq!(fx.kernel.read_user(fx.pid, buf, 10).unwrap(), b"hello file");
}
