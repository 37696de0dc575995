pub mod sema;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::log_info;
use crate::process::{wait_satisfied, ProcHandle, ProcStatus, ProcessTable};

pub use sema::SemTable;

/// Per-hart scheduling state. Each hart of the emulated machine carries
/// its own notion of the current process; nothing about "current" is
/// global.
#[derive(Debug, Clone, Copy)]
pub struct HartContext {
    pub hart_id: usize,
    pub current: Option<ProcHandle>,
}

impl HartContext {
    pub fn new(hart_id: usize) -> HartContext {
        HartContext { hart_id, current: None }
    }
}

/// What the embedding machine should do next: enter user mode in the
/// given address space, or power off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Run { proc: ProcHandle, satp: u64, epc: u64 },
    Shutdown,
}

/// The ready and blocked queues. Both are plain containers of handles;
/// a process knows its status but not its queue position. Processes
/// parked on a semaphore live in that semaphore's waiter queue instead
/// of here.
pub struct Scheduler {
    ready: VecDeque<ProcHandle>,
    blocked: Vec<ProcHandle>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { ready: VecDeque::new(), blocked: Vec::new() }
    }

    /// Queue a process to run, setting it Ready. Inserting a handle that
    /// is already queued is a no-op.
    pub fn insert_to_ready_queue(&mut self, procs: &mut ProcessTable, h: ProcHandle) {
        if self.ready.contains(&h) {
            return;
        }
        self.blocked.retain(|&b| b != h);
        let proc = procs.get_mut(h);
        log_info!("going to insert process {} to ready queue.", proc.pid);
        proc.status = ProcStatus::Ready;
        self.ready.push_back(h);
    }

    /// Park a process that is blocked inside `wait`.
    pub fn insert_to_blocked_queue(&mut self, procs: &mut ProcessTable, h: ProcHandle) {
        procs.get_mut(h).status = ProcStatus::Blocked;
        if !self.blocked.contains(&h) {
            self.blocked.push(h);
        }
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

/// Pick the next process for a hart. First every process blocked in
/// `wait` whose target has become a zombie is moved back to the ready
/// queue; then the head of the ready queue runs. An empty ready queue
/// means shutdown when every remaining slot is free or zombie, and a
/// kernel panic when some live process is parked with nothing left that
/// could ever wake it.
pub fn schedule(procs: &mut ProcessTable, sched: &mut Scheduler, hart: &mut HartContext) -> Dispatch {
    let mut woken = Vec::new();
    sched.blocked.retain(|&h| {
        let target = match procs.get(h).waiting {
            Some(target) => target,
            None => return true,
        };
        if wait_satisfied(procs, h, target) {
            woken.push(h);
            false
        } else {
            true
        }
    });
    for h in woken {
        let proc = procs.get_mut(h);
        proc.waiting = None;
        proc.status = ProcStatus::Ready;
        sched.ready.push_back(h);
    }

    if let Some(h) = sched.ready.pop_front() {
        let hart_id = hart.hart_id;
        let proc = procs.get_mut(h);
        log_info!("going to schedule process {} to run.", proc.pid);
        proc.status = ProcStatus::Running;
        proc.trapframe.regs.tp = hart_id as u64;
        proc.trapframe.kernel_sp = proc.kstack.base_pa() + crate::config::PGSIZE;
        hart.current = Some(h);
        let satp = proc.pt.make_satp();
        let epc = proc.trapframe.epc;
        return Dispatch::Run { proc: h, satp, epc };
    }

    hart.current = None;
    for h in procs.live_handles() {
        let proc = procs.get(h);
        if proc.status != ProcStatus::Zombie {
            panic!(
                "ready queue empty, but process {} is still {:?}; nothing left can wake it",
                proc.pid, proc.status
            );
        }
    }
    log_info!("no more ready processes, system shutdown now.");
    Dispatch::Shutdown
}
