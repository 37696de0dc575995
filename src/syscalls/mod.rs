//! The syscall surface. User programs place the syscall number in `a0`
//! and up to seven arguments in `a1`..`a7`; the return value comes back
//! in `a0`. Numbers start at 64 to stay clear of the trap causes the
//! embedding machine reports.

use alloc::string::String;
use alloc::vec;

use crate::config::PGSIZE;
use crate::error::{KernelError, KernelResult};
use crate::memory::{copy_in, copy_in_cstr, copy_out, PteFlags};
use crate::process::{
    do_exec, do_exit, do_fork, do_wait, Process, ProcStatus, WaitOutcome, WaitTarget,
};
use crate::scheduler::HartContext;
use crate::{log_info, sprint, KernelState};

pub const SYS_PRINT: u64 = 64;
pub const SYS_EXIT: u64 = 65;
pub const SYS_FORK: u64 = 66;
pub const SYS_YIELD: u64 = 67;
pub const SYS_WAIT: u64 = 68;
pub const SYS_EXEC: u64 = 69;
pub const SYS_ALLOCATE_PAGE: u64 = 70;
pub const SYS_FREE_PAGE: u64 = 71;
pub const SYS_MALLOC: u64 = 72;
pub const SYS_FREE: u64 = 73;
pub const SYS_BACKTRACE: u64 = 74;
pub const SYS_PRINTPA: u64 = 75;
pub const SYS_SEM_NEW: u64 = 76;
pub const SYS_SEM_P: u64 = 77;
pub const SYS_SEM_V: u64 = 78;
pub const SYS_OPEN: u64 = 79;
pub const SYS_READ: u64 = 80;
pub const SYS_WRITE: u64 = 81;
pub const SYS_LSEEK: u64 = 82;
pub const SYS_STAT: u64 = 83;
pub const SYS_CLOSE: u64 = 84;
pub const SYS_OPENDIR: u64 = 85;
pub const SYS_READDIR: u64 = 86;
pub const SYS_MKDIR: u64 = 87;
pub const SYS_CLOSEDIR: u64 = 88;
pub const SYS_LINK: u64 = 89;
pub const SYS_UNLINK: u64 = 90;
pub const SYS_RCWD: u64 = 91;
pub const SYS_CCWD: u64 = 92;

const PATH_MAX: usize = 256;

/// What the trap handler should do after a syscall: sret straight back
/// into the same process, or run the scheduler first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    Resume,
    Reschedule,
}

/// Handle the syscall pending in the current process's trap frame.
pub fn dispatch(state: &mut KernelState, hart: &mut HartContext) -> KernelResult<TrapOutcome> {
    let h = hart.current.unwrap_or_else(|| panic!("syscall trap with no current process"));
    let (nr, a) = {
        let regs = &state.procs.get(h).trapframe.regs;
        (regs.a0, [regs.a1, regs.a2, regs.a3, regs.a4, regs.a5, regs.a6, regs.a7])
    };

    let KernelState { memory, procs, sched, sems, host_fs, .. } = state;

    let (ret, outcome): (Option<i64>, TrapOutcome) = match nr {
        SYS_PRINT => {
            let proc = procs.get_mut(h);
            let mut bytes = vec![0u8; a[1] as usize];
            copy_in(memory, &proc.pt, a[0], &mut bytes)?;
            sprint!("{}", String::from_utf8_lossy(&bytes));
            (Some(0), TrapOutcome::Resume)
        }
        SYS_EXIT => {
            log_info!("User exit with code: {}.", a[0] as i64);
            do_exit(procs, h, a[0] as i64);
            (None, TrapOutcome::Reschedule)
        }
        SYS_FORK => {
            let child = do_fork(memory, procs, h)?;
            let pid = procs.get(child).pid;
            sched.insert_to_ready_queue(procs, child);
            (Some(pid as i64), TrapOutcome::Resume)
        }
        SYS_YIELD => {
            sched.insert_to_ready_queue(procs, h);
            (Some(0), TrapOutcome::Reschedule)
        }
        SYS_WAIT => {
            let target = match a[0] as i64 {
                -1 => WaitTarget::AnyChild,
                pid => WaitTarget::Pid(pid as u32),
            };
            match do_wait(memory, procs, h, target) {
                WaitOutcome::Reaped(pid) => (Some(pid as i64), TrapOutcome::Resume),
                WaitOutcome::NoChild => (Some(-1), TrapOutcome::Resume),
                WaitOutcome::Retry => {
                    procs.get_mut(h).waiting = Some(target);
                    sched.insert_to_blocked_queue(procs, h);
                    (Some(-2), TrapOutcome::Reschedule)
                }
            }
        }
        SYS_EXEC => {
            let (path, arg) = {
                let proc = procs.get(h);
                let path = copy_in_cstr(memory, &proc.pt, a[0], PATH_MAX)?;
                let arg = copy_in_cstr(memory, &proc.pt, a[1], PATH_MAX)?;
                (crate::vfs::normalize(&proc.cwd, &path), arg)
            };
            match host_fs.open(&path) {
                Some(image) => {
                    do_exec(memory, procs, h, &image, &arg)?;
                    // a0 already carries argc for the new program
                    (None, TrapOutcome::Resume)
                }
                None => (Some(-1), TrapOutcome::Resume),
            }
        }
        SYS_ALLOCATE_PAGE => {
            let Process { pt, regions, heap, .. } = procs.get_mut(h);
            let va = heap.take_page();
            let frame = memory.alloc_page()?;
            pt.map(va, frame, PteFlags::READ | PteFlags::WRITE | PteFlags::USER)?;
            regions.set_heap_pages(heap.span_pages());
            (Some(va as i64), TrapOutcome::Resume)
        }
        SYS_FREE_PAGE => {
            let Process { pt, heap, .. } = procs.get_mut(h);
            heap.give_page(a[0])?;
            let pte = pt.unmap(a[0]).ok_or(KernelError::BadAddress(a[0]))?;
            memory.release(pte.ppn());
            (Some(0), TrapOutcome::Resume)
        }
        SYS_MALLOC => {
            let Process { pt, regions, heap, .. } = procs.get_mut(h);
            let va = heap.alloc(a[0], |grow_va, npages| {
                for page in 0..npages {
                    let frame = memory.alloc_page()?;
                    pt.map(
                        grow_va + page * PGSIZE,
                        frame,
                        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
                    )?;
                }
                Ok(())
            })?;
            regions.set_heap_pages(heap.span_pages());
            (Some(va as i64), TrapOutcome::Resume)
        }
        SYS_FREE => {
            procs.get_mut(h).heap.free(a[0])?;
            (Some(0), TrapOutcome::Resume)
        }
        SYS_BACKTRACE => {
            backtrace(memory, procs.get(h), a[0])?;
            (Some(0), TrapOutcome::Resume)
        }
        SYS_PRINTPA => {
            let proc = procs.get(h);
            let pa = proc.pt.lookup_pa(a[0]).ok_or(KernelError::BadAddress(a[0]))?;
            sprint!("{:#x}\n", pa);
            (Some(pa as i64), TrapOutcome::Resume)
        }
        SYS_SEM_NEW => {
            let id = sems.do_sem_new(a[0] as i64)?;
            (Some(id as i64), TrapOutcome::Resume)
        }
        SYS_SEM_P => {
            if sems.do_sem_p(a[0], h)? {
                procs.get_mut(h).status = ProcStatus::Blocked;
                (Some(0), TrapOutcome::Reschedule)
            } else {
                (Some(0), TrapOutcome::Resume)
            }
        }
        SYS_SEM_V => {
            if let Some(woken) = sems.do_sem_v(a[0])? {
                sched.insert_to_ready_queue(procs, woken);
            }
            (Some(0), TrapOutcome::Resume)
        }
        SYS_OPEN => {
            let proc = procs.get_mut(h);
            let path = copy_in_cstr(memory, &proc.pt, a[0], PATH_MAX)?;
            let path = crate::vfs::normalize(&proc.cwd, &path);
            let ret = match host_fs.open(&path) {
                Some(data) => recoverable(proc.files.open_host(data).map(|fd| fd as i64))?,
                None => -1,
            };
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_READ => {
            let Process { pt, files, .. } = procs.get_mut(h);
            let mut buf = vec![0u8; a[2] as usize];
            let ret = match files.read(a[0], &mut buf) {
                Ok(n) => {
                    copy_out(memory, pt, a[1], &buf[..n])?;
                    n as i64
                }
                Err(err) => recoverable(Err(err))?,
            };
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_WRITE => {
            let Process { pt, files, .. } = procs.get_mut(h);
            let ret = match files.is_console(a[0]) {
                Ok(true) => {
                    let mut bytes = vec![0u8; a[2] as usize];
                    copy_in(memory, pt, a[1], &mut bytes)?;
                    sprint!("{}", String::from_utf8_lossy(&bytes));
                    a[2] as i64
                }
                // host files are read-only images
                Ok(false) => -1,
                Err(err) => recoverable(Err(err))?,
            };
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_LSEEK => {
            let files = &mut procs.get_mut(h).files;
            let ret = recoverable(files.lseek(a[0], a[1] as i64, a[2]).map(|off| off as i64))?;
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_STAT => {
            let Process { pt, files, .. } = procs.get_mut(h);
            let ret = match files.size(a[0]) {
                Ok(size) => {
                    copy_out(memory, pt, a[1], &size.to_le_bytes())?;
                    0
                }
                Err(err) => recoverable(Err(err))?,
            };
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_CLOSE | SYS_CLOSEDIR => {
            let ret = recoverable(procs.get_mut(h).files.close(a[0]).map(|_| 0))?;
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_OPENDIR => {
            let proc = procs.get_mut(h);
            let path = copy_in_cstr(memory, &proc.pt, a[0], PATH_MAX)?;
            let path = crate::vfs::normalize(&proc.cwd, &path);
            let ret = match host_fs.list(&path) {
                Ok(entries) => recoverable(proc.files.open_dir(entries).map(|fd| fd as i64))?,
                Err(_) => -1,
            };
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_READDIR => {
            let Process { pt, files, .. } = procs.get_mut(h);
            let ret = match files.read_dir(a[0]) {
                Ok(Some(name)) => {
                    let mut bytes = name.into_bytes();
                    bytes.push(0);
                    copy_out(memory, pt, a[1], &bytes)?;
                    (bytes.len() - 1) as i64
                }
                Ok(None) => -1,
                Err(err) => recoverable(Err(err))?,
            };
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_MKDIR => {
            let proc = procs.get(h);
            let path = copy_in_cstr(memory, &proc.pt, a[0], PATH_MAX)?;
            let path = crate::vfs::normalize(&proc.cwd, &path);
            let ret = recoverable(host_fs.mkdir(&path).map(|_| 0))?;
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_LINK => {
            let proc = procs.get(h);
            let from = copy_in_cstr(memory, &proc.pt, a[0], PATH_MAX)?;
            let to = copy_in_cstr(memory, &proc.pt, a[1], PATH_MAX)?;
            let from = crate::vfs::normalize(&proc.cwd, &from);
            let to = crate::vfs::normalize(&proc.cwd, &to);
            let ret = recoverable(host_fs.link(&from, &to).map(|_| 0))?;
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_UNLINK => {
            let proc = procs.get(h);
            let path = copy_in_cstr(memory, &proc.pt, a[0], PATH_MAX)?;
            let path = crate::vfs::normalize(&proc.cwd, &path);
            let ret = recoverable(host_fs.unlink(&path).map(|_| 0))?;
            (Some(ret), TrapOutcome::Resume)
        }
        SYS_RCWD => {
            let Process { pt, cwd, .. } = procs.get_mut(h);
            let mut bytes = cwd.as_bytes().to_vec();
            bytes.push(0);
            copy_out(memory, pt, a[0], &bytes)?;
            (Some(0), TrapOutcome::Resume)
        }
        SYS_CCWD => {
            let proc = procs.get_mut(h);
            let path = copy_in_cstr(memory, &proc.pt, a[0], PATH_MAX)?;
            let path = crate::vfs::normalize(&proc.cwd, &path);
            let ret = if host_fs.is_dir(&path) {
                proc.cwd = path;
                0
            } else {
                -1
            };
            (Some(ret), TrapOutcome::Resume)
        }
        other => return Err(KernelError::UnknownSyscall(other)),
    };

    if let Some(value) = ret {
        if let Some(proc) = procs.try_get_mut(h) {
            proc.trapframe.regs.a0 = value as u64;
        }
    }
    Ok(outcome)
}

/// File errors are not fatal to the process; they come back as -1 the way
/// the classic proxy-kernel interface reports them.
fn recoverable(result: KernelResult<i64>) -> KernelResult<i64> {
    match result {
        Ok(v) => Ok(v),
        Err(
            KernelError::NoSuchFile | KernelError::BadFileDescriptor | KernelError::TooManyFiles,
        ) => Ok(-1),
        Err(err) => Err(err),
    }
}

/// Walk the user stack's frame-pointer chain and print one function name
/// per frame. Frames resolve against the global function symbols captured
/// at load time; the walk stops at `depth` frames, at a frame without a
/// saved return address, or at an address no symbol covers.
fn backtrace(
    memory: &crate::memory::PhysMemory,
    proc: &Process,
    depth: u64,
) -> KernelResult<()> {
    let mut fp = proc.trapframe.regs.s0;
    for _ in 0..depth {
        if fp < 16 {
            break;
        }
        let mut word = [0u8; 8];
        if copy_in(memory, &proc.pt, fp - 8, &mut word).is_err() {
            break;
        }
        let ra = u64::from_le_bytes(word);
        if ra == 0 {
            break;
        }
        // symbols are sorted by descending address, so the first one at or
        // below ra is the containing function
        let name = proc
            .symbols
            .iter()
            .find(|sym| sym.addr <= ra)
            .map(|sym| sym.name.as_str());
        match name {
            Some(name) => sprint!("{}\n", name),
            None => break,
        }
        if copy_in(memory, &proc.pt, fp - 16, &mut word).is_err() {
            break;
        }
        fp = u64::from_le_bytes(word);
    }
    Ok(())
}
