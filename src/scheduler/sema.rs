use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::config::SEM_MAX;
use crate::error::{KernelError, KernelResult};
use crate::process::ProcHandle;

struct Semaphore {
    count: i64,
    waiters: VecDeque<ProcHandle>,
}

/// The machine-wide semaphore table. Semaphore ids are indices into this
/// table; a created semaphore lives until shutdown, there is no destroy
/// operation.
pub struct SemTable {
    sems: Vec<Semaphore>,
}

impl SemTable {
    pub fn new() -> SemTable {
        SemTable { sems: Vec::new() }
    }

    pub fn do_sem_new(&mut self, initial: i64) -> KernelResult<u64> {
        if self.sems.len() >= SEM_MAX {
            return Err(KernelError::TooManySemaphores);
        }
        self.sems.push(Semaphore { count: initial, waiters: VecDeque::new() });
        Ok(self.sems.len() as u64 - 1)
    }

    fn sem_mut(&mut self, id: u64) -> KernelResult<&mut Semaphore> {
        self.sems.get_mut(id as usize).ok_or(KernelError::InvalidSemaphore)
    }

    /// P: take one unit. A negative count after the decrement means the
    /// caller must block; it is queued FIFO and `true` is returned.
    pub fn do_sem_p(&mut self, id: u64, caller: ProcHandle) -> KernelResult<bool> {
        let sem = self.sem_mut(id)?;
        sem.count -= 1;
        if sem.count < 0 {
            sem.waiters.push_back(caller);
            return Ok(true);
        }
        Ok(false)
    }

    /// V: give one unit back, waking the longest-waiting process if any.
    /// The caller moves the returned handle to the ready queue.
    pub fn do_sem_v(&mut self, id: u64) -> KernelResult<Option<ProcHandle>> {
        let sem = self.sem_mut(id)?;
        sem.count += 1;
        Ok(sem.waiters.pop_front())
    }
}

impl Default for SemTable {
    fn default() -> SemTable {
        SemTable::new()
    }
}
