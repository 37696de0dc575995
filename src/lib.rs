//! A teaching proxy kernel for an emulated RISC-V machine. The crate
//! models the whole machine side in software (physical frames, page
//! tables, the console stream), which keeps every kernel path runnable
//! on a host: an embedder drives the `Kernel` facade the way trap
//! handling firmware would, and tests play the role of user programs.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod console;
pub mod error;
pub mod loader;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod syscalls;
pub mod vfs;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::memory::{PhysMemory, PhysPageNum, PteFlags};
use crate::process::{
    alloc_process, AddressLayout, MappedRegion, ProcStatus, Process, ProcessTable, TrapFrame,
};
use crate::scheduler::{Dispatch, HartContext, Scheduler, SemTable};
use crate::syscalls::TrapOutcome;
use crate::vfs::HostFs;

/// Everything the kernel owns, guarded as one unit. Trap handling is
/// serialized across harts by the single lock, which is exactly the
/// classic proxy-kernel discipline of one big kernel lock.
pub struct KernelState {
    pub memory: PhysMemory,
    pub procs: ProcessTable,
    pub sched: Scheduler,
    pub sems: SemTable,
    pub host_fs: HostFs,
    pub trap_vector: PhysPageNum,
}

pub struct Kernel {
    state: Mutex<KernelState>,
}

impl Kernel {
    /// Bring up a machine with the given amount of physical memory. The
    /// trap vector page is carved out first; every process maps it.
    pub fn new(phys_pages: usize) -> Kernel {
        let mut memory = PhysMemory::new(phys_pages);
        let trap_vector = memory
            .alloc_page()
            .unwrap_or_else(|_| panic!("no physical memory for the trap vector page"));
        Kernel {
            state: Mutex::new(KernelState {
                memory,
                procs: ProcessTable::new(),
                sched: Scheduler::new(),
                sems: SemTable::new(),
                host_fs: HostFs::new(),
                trap_vector,
            }),
        }
    }

    /// Make a program image visible to `exec` and the file syscalls.
    pub fn register_program(&self, path: &str, image: Vec<u8>) {
        self.state.lock().host_fs.register(path, image);
    }

    /// Create the first process of a hart from a registered program and
    /// queue it to run. A missing image is a machine configuration error.
    pub fn boot_hart(&self, hart: &HartContext, path: &str) -> KernelResult<u32> {
        let state = &mut *self.state.lock();
        let image = state
            .host_fs
            .open(&vfs::normalize("/", path))
            .unwrap_or_else(|| panic!("boot application {} does not exist", path));
        let layout = layout_for_hart(hart.hart_id);
        let handle = alloc_process(&mut state.memory, &mut state.procs, state.trap_vector, layout)?;

        let pid = {
            let proc = state.procs.get_mut(handle);
            let loaded =
                loader::load_elf(&mut state.memory, &mut proc.pt, &mut proc.regions, &image)?;
            proc.trapframe.epc = loaded.entry;
            proc.symbols = loaded.symbols;
            proc.pid
        };
        state.sched.insert_to_ready_queue(&mut state.procs, handle);
        crate::log_info!("process {} boots on hart {}: {}", pid, hart.hart_id, path);
        Ok(pid)
    }

    /// Run the scheduler for a hart.
    pub fn schedule(&self, hart: &mut HartContext) -> Dispatch {
        let state = &mut *self.state.lock();
        scheduler::schedule(&mut state.procs, &mut state.sched, hart)
    }

    /// Handle the syscall already staged in the current trap frame.
    pub fn handle_syscall(&self, hart: &mut HartContext) -> KernelResult<TrapOutcome> {
        let state = &mut *self.state.lock();
        syscalls::dispatch(state, hart)
    }

    /// Issue a syscall on behalf of the current process: stage the number
    /// and arguments in the trap frame, dispatch, and hand back whatever
    /// landed in `a0` along with the trap outcome.
    pub fn syscall(
        &self,
        hart: &mut HartContext,
        nr: u64,
        args: &[u64],
    ) -> KernelResult<(i64, TrapOutcome)> {
        let h = hart.current.unwrap_or_else(|| panic!("syscall with no current process"));
        {
            let state = &mut *self.state.lock();
            let regs = &mut state.procs.get_mut(h).trapframe.regs;
            regs.a0 = nr;
            let slots = [
                &mut regs.a1,
                &mut regs.a2,
                &mut regs.a3,
                &mut regs.a4,
                &mut regs.a5,
                &mut regs.a6,
                &mut regs.a7,
            ];
            for (slot, value) in slots.into_iter().zip(args) {
                *slot = *value;
            }
        }
        let outcome = self.handle_syscall(hart)?;
        let state = self.state.lock();
        let ret = state.procs.get(h).trapframe.regs.a0 as i64;
        Ok((ret, outcome))
    }

    /// A store fault taken in user mode. Only a copy-on-write page is
    /// forgiven: it gets a private writable copy and the process resumes.
    pub fn handle_store_fault(&self, hart: &HartContext, va: u64) -> KernelResult<TrapOutcome> {
        let h = hart.current.unwrap_or_else(|| panic!("store fault with no current process"));
        let state = &mut *self.state.lock();
        let Process { pt, .. } = state.procs.get_mut(h);
        let pte = pt.pte(va).ok_or(KernelError::BadAddress(va))?;
        if !pte.flags().contains(PteFlags::COW) {
            return Err(KernelError::BadAddress(va));
        }
        memory::ensure_writable(&mut state.memory, pt, va)?;
        Ok(TrapOutcome::Resume)
    }

    // ── inspection, for embedders and tests ──────────────────────

    /// Pid of the process the hart is currently running, if any.
    pub fn current_pid(&self, hart: &HartContext) -> Option<u32> {
        let state = self.state.lock();
        hart.current.and_then(|h| state.procs.try_get(h)).map(|p| p.pid)
    }

    pub fn status(&self, pid: u32) -> ProcStatus {
        let state = self.state.lock();
        match state.procs.handle_by_pid(pid) {
            Some(h) => state.procs.status_of(h),
            None => ProcStatus::Free,
        }
    }

    pub fn read_user(&self, pid: u32, va: u64, len: usize) -> KernelResult<Vec<u8>> {
        let state = self.state.lock();
        let h = state.procs.handle_by_pid(pid).ok_or(KernelError::NoSuchChild)?;
        let proc = state.procs.get(h);
        let mut buf = vec![0u8; len];
        memory::copy_in(&state.memory, &proc.pt, va, &mut buf)?;
        Ok(buf)
    }

    /// Store into user memory exactly as a user-mode instruction would,
    /// copy-on-write resolution included.
    pub fn write_user(&self, pid: u32, va: u64, data: &[u8]) -> KernelResult<()> {
        let state = &mut *self.state.lock();
        let h = state.procs.handle_by_pid(pid).ok_or(KernelError::NoSuchChild)?;
        let Process { pt, .. } = state.procs.get_mut(h);
        memory::user_store(&mut state.memory, pt, va, data)
    }

    pub fn lookup_pa(&self, pid: u32, va: u64) -> Option<u64> {
        let state = self.state.lock();
        let h = state.procs.handle_by_pid(pid)?;
        state.procs.get(h).pt.lookup_pa(va)
    }

    pub fn regions(&self, pid: u32) -> Vec<MappedRegion> {
        let state = self.state.lock();
        match state.procs.handle_by_pid(pid) {
            Some(h) => state.procs.get(h).regions.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn trapframe(&self, pid: u32) -> Option<TrapFrame> {
        let state = self.state.lock();
        let h = state.procs.handle_by_pid(pid)?;
        Some(state.procs.get(h).trapframe.clone())
    }

    /// Edit a process's trap frame in place (an embedder restoring state,
    /// or a test staging registers).
    pub fn with_trapframe<R>(&self, pid: u32, f: impl FnOnce(&mut TrapFrame) -> R) -> Option<R> {
        let state = &mut *self.state.lock();
        let h = state.procs.handle_by_pid(pid)?;
        Some(f(&mut state.procs.get_mut(h).trapframe))
    }

    /// Frames currently resident in physical memory (diagnostics).
    pub fn resident_pages(&self) -> usize {
        self.state.lock().memory.resident_pages()
    }

    /// Drain everything the machine printed since the last call.
    pub fn drain_console(&self) -> String {
        console::drain()
    }
}

/// The user-space layout handed to processes created on a hart.
pub fn layout_for_hart(hart_id: usize) -> AddressLayout {
    AddressLayout {
        stack_top: config::user_stack_top(hart_id),
        heap_base: config::user_heap_base(hart_id),
    }
}
