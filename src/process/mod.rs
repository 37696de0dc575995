pub mod heap;

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{MAX_MAPPED_REGIONS, NPROC, PGSIZE};
use crate::error::{KernelError, KernelResult};
use crate::loader::FuncSymbol;
use crate::memory::{PageTable, PhysMemory, PhysPageNum, Pte, PteFlags};
use crate::vfs::FileTable;

pub use heap::UserHeap;

// ══════════════════════════════════════════════════════════════
//  Types
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    /// The slot holds no process at all.
    Free,
    Ready,
    Running,
    Blocked,
    Zombie,
}

/// What a mapped region is for. The kind decides the fork policy: stacks
/// and data are copied, code is shared read-only, heap pages are shared
/// copy-on-write, context and system pages are rebuilt per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegKind {
    Code,
    Data,
    Stack,
    Heap,
    Context,
    System,
}

#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub va: u64,
    pub npages: u64,
    pub kind: SegKind,
}

/// The per-process table of mapped regions, fixed capacity like the rest
/// of the PCB.
pub struct RegionTable {
    regions: [Option<MappedRegion>; MAX_MAPPED_REGIONS],
}

impl RegionTable {
    pub fn new() -> RegionTable {
        RegionTable { regions: [None; MAX_MAPPED_REGIONS] }
    }

    pub fn add(&mut self, region: MappedRegion) -> KernelResult<()> {
        let new_end = region.va + region.npages * PGSIZE;
        for existing in self.iter() {
            let end = existing.va + existing.npages * PGSIZE;
            if region.va < end && existing.va < new_end {
                return Err(KernelError::CorruptSegment);
            }
        }
        let slot = self
            .regions
            .iter()
            .position(|r| r.is_none())
            .ok_or(KernelError::TooManyRegions)?;
        self.regions[slot] = Some(region);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappedRegion> {
        self.regions.iter().flatten()
    }

    pub fn find(&self, kind: SegKind) -> Option<&MappedRegion> {
        self.iter().find(|r| r.kind == kind)
    }

    /// Record the new page span of the heap region after it grew.
    pub fn set_heap_pages(&mut self, npages: u64) {
        for region in self.regions.iter_mut().flatten() {
            if region.kind == SegKind::Heap {
                region.npages = npages;
                return;
            }
        }
        panic!("process has no heap region");
    }
}

impl Default for RegionTable {
    fn default() -> RegionTable {
        RegionTable::new()
    }
}

/// The RISC-V integer register file as saved at trap entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralRegs {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TrapFrame {
    pub regs: GeneralRegs,
    pub kernel_sp: u64,
    pub kernel_satp: u64,
    pub epc: u64,
}

/// Where a process's user stack and heap live. Each boot hart hands out a
/// distinct window so concurrently loaded programs never collide.
#[derive(Debug, Clone, Copy)]
pub struct AddressLayout {
    pub stack_top: u64,
    pub heap_base: u64,
}

/// A generation-tagged reference to a process slot. A handle left over
/// from before the slot was reclaimed no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcHandle {
    pub slot: usize,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    AnyChild,
    Pid(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A zombie child was reclaimed; its pid is the return value.
    Reaped(u32),
    /// Children exist but none has exited yet; block and retry.
    Retry,
    /// The caller has no matching child.
    NoChild,
}

pub struct Process {
    pub pid: u32,
    pub status: ProcStatus,
    pub parent: Option<ProcHandle>,
    pub exit_code: i64,
    /// Set while the process is blocked inside `wait`; the scheduler sweep
    /// uses it to decide when to wake the process.
    pub waiting: Option<WaitTarget>,
    pub trapframe: TrapFrame,
    pub kstack: PhysPageNum,
    pub pt: PageTable,
    pub regions: RegionTable,
    pub heap: UserHeap,
    pub files: FileTable,
    pub cwd: String,
    pub layout: AddressLayout,
    pub symbols: Vec<FuncSymbol>,
}

// ══════════════════════════════════════════════════════════════
//  Process table
// ══════════════════════════════════════════════════════════════

struct Slot {
    generation: u64,
    proc: Option<Process>,
}

/// The fixed-size arena of process slots. A process's pid is its slot
/// index, so pids are reused after reclamation; generation-tagged handles
/// are what the kernel itself holds across a reclaim.
pub struct ProcessTable {
    slots: Vec<Slot>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        let mut slots = Vec::with_capacity(NPROC);
        for _ in 0..NPROC {
            slots.push(Slot { generation: 0, proc: None });
        }
        ProcessTable { slots }
    }

    fn reserve_slot(&self) -> KernelResult<usize> {
        self.slots
            .iter()
            .position(|s| s.proc.is_none())
            .ok_or(KernelError::OutOfProcesses)
    }

    fn install(&mut self, slot: usize, proc: Process) -> ProcHandle {
        let generation = self.slots[slot].generation;
        self.slots[slot].proc = Some(proc);
        ProcHandle { slot, generation }
    }

    pub fn try_get(&self, h: ProcHandle) -> Option<&Process> {
        let slot = self.slots.get(h.slot)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.proc.as_ref()
    }

    pub fn try_get_mut(&mut self, h: ProcHandle) -> Option<&mut Process> {
        let slot = self.slots.get_mut(h.slot)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.proc.as_mut()
    }

    /// Resolve a handle the kernel itself created. A stale handle here is a
    /// bookkeeping bug, not a recoverable condition.
    pub fn get(&self, h: ProcHandle) -> &Process {
        self.try_get(h).unwrap_or_else(|| panic!("stale process handle for slot {}", h.slot))
    }

    pub fn get_mut(&mut self, h: ProcHandle) -> &mut Process {
        self.try_get_mut(h)
            .unwrap_or_else(|| panic!("stale process handle for slot {}", h.slot))
    }

    /// Flat scan for the live process with the given pid.
    pub fn handle_by_pid(&self, pid: u32) -> Option<ProcHandle> {
        self.slots.iter().enumerate().find_map(|(slot, s)| {
            s.proc
                .as_ref()
                .filter(|p| p.pid == pid)
                .map(|_| ProcHandle { slot, generation: s.generation })
        })
    }

    pub fn live_handles(&self) -> Vec<ProcHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.proc.is_some())
            .map(|(slot, s)| ProcHandle { slot, generation: s.generation })
            .collect()
    }

    pub fn status_of(&self, h: ProcHandle) -> ProcStatus {
        match self.try_get(h) {
            Some(p) => p.status,
            None => ProcStatus::Free,
        }
    }

    /// Tear down a zombie and vacate its slot. The address space release
    /// drops every mapped frame, the trap vector's shared reference
    /// included; the kernel stack is not user-mapped and goes separately.
    pub fn reclaim(&mut self, memory: &mut PhysMemory, h: ProcHandle) {
        let slot = &mut self.slots[h.slot];
        assert_eq!(slot.generation, h.generation, "reclaiming through a stale handle");
        let proc = slot.proc.take().unwrap_or_else(|| panic!("slot {} already free", h.slot));
        proc.pt.release(memory);
        memory.release(proc.kstack);
        slot.generation += 1;
    }
}

impl Default for ProcessTable {
    fn default() -> ProcessTable {
        ProcessTable::new()
    }
}

// ══════════════════════════════════════════════════════════════
//  Lifecycle operations
// ══════════════════════════════════════════════════════════════

/// Build the skeleton of a fresh process: page table, kernel stack, trap
/// frame page, shared trap vector page, one stack page and an empty heap.
/// Code and data arrive later via the loader.
pub fn alloc_process(
    memory: &mut PhysMemory,
    procs: &mut ProcessTable,
    trap_vector: PhysPageNum,
    layout: AddressLayout,
) -> KernelResult<ProcHandle> {
    let slot = procs.reserve_slot()?;
    let mut pt = PageTable::new(memory)?;
    let mut regions = RegionTable::new();

    let kstack = memory.alloc_page()?;

    let tf_frame = memory.alloc_page()?;
    pt.map(tf_frame.base_pa(), tf_frame, PteFlags::READ | PteFlags::WRITE)?;
    regions.add(MappedRegion { va: tf_frame.base_pa(), npages: 1, kind: SegKind::Context })?;

    memory.retain(trap_vector);
    pt.map(trap_vector.base_pa(), trap_vector, PteFlags::READ | PteFlags::EXEC)?;
    regions.add(MappedRegion { va: trap_vector.base_pa(), npages: 1, kind: SegKind::System })?;

    let stack = memory.alloc_page()?;
    let stack_va = layout.stack_top - PGSIZE;
    pt.map(stack_va, stack, PteFlags::READ | PteFlags::WRITE | PteFlags::USER)?;
    regions.add(MappedRegion { va: stack_va, npages: 1, kind: SegKind::Stack })?;

    regions.add(MappedRegion { va: layout.heap_base, npages: 0, kind: SegKind::Heap })?;

    let mut trapframe = TrapFrame::default();
    trapframe.regs.sp = layout.stack_top;
    trapframe.kernel_sp = kstack.base_pa() + PGSIZE;

    let proc = Process {
        pid: slot as u32,
        status: ProcStatus::Ready,
        parent: None,
        exit_code: 0,
        waiting: None,
        trapframe,
        kstack,
        pt,
        regions,
        heap: UserHeap::new(layout.heap_base),
        files: FileTable::new(),
        cwd: String::from("/"),
        layout,
        symbols: Vec::new(),
    };
    Ok(procs.install(slot, proc))
}

/// Duplicate the calling process. Stacks and data segments are copied
/// byte for byte, code pages are shared outright, heap pages are shared
/// copy-on-write with the parent losing the write bit on each, and the
/// child starts with `a0 == 0` in an otherwise identical trap frame.
pub fn do_fork(
    memory: &mut PhysMemory,
    procs: &mut ProcessTable,
    parent_h: ProcHandle,
) -> KernelResult<ProcHandle> {
    let slot = procs.reserve_slot()?;
    let parent = procs.get_mut(parent_h);

    let mut trapframe = parent.trapframe.clone();
    let heap = parent.heap.clone();
    let files = parent.files.clone();
    let cwd = parent.cwd.clone();
    let layout = parent.layout;
    let symbols = parent.symbols.clone();
    let snapshot: Vec<MappedRegion> = parent.regions.iter().copied().collect();
    let parent_pt = &mut parent.pt;

    let mut pt = PageTable::new(memory)?;
    let mut regions = RegionTable::new();
    let kstack = memory.alloc_page()?;

    for region in snapshot {
        match region.kind {
            SegKind::Context => {
                let tf_frame = memory.alloc_page()?;
                pt.map(tf_frame.base_pa(), tf_frame, PteFlags::READ | PteFlags::WRITE)?;
                regions.add(MappedRegion {
                    va: tf_frame.base_pa(),
                    npages: 1,
                    kind: SegKind::Context,
                })?;
            }
            SegKind::System => {
                let pte = parent_pt
                    .pte(region.va)
                    .ok_or(KernelError::BadAddress(region.va))?;
                memory.retain(pte.ppn());
                pt.map(region.va, pte.ppn(), pte.flags())?;
                regions.add(region)?;
            }
            SegKind::Stack | SegKind::Data => {
                for page in 0..region.npages {
                    let va = region.va + page * PGSIZE;
                    let pte = parent_pt.pte(va).ok_or(KernelError::BadAddress(va))?;
                    let fresh = memory.alloc_page()?;
                    memory.copy_page(pte.ppn(), fresh);
                    pt.map(va, fresh, pte.flags())?;
                }
                regions.add(region)?;
            }
            SegKind::Code => {
                for page in 0..region.npages {
                    let va = region.va + page * PGSIZE;
                    let pte = parent_pt.pte(va).ok_or(KernelError::BadAddress(va))?;
                    memory.retain(pte.ppn());
                    pt.map(va, pte.ppn(), pte.flags())?;
                }
                regions.add(region)?;
            }
            SegKind::Heap => {
                // Pages handed back via free_page are unmapped and skipped;
                // the cloned heap manager remembers them on its free list.
                for page in 0..region.npages {
                    let va = region.va + page * PGSIZE;
                    let pte = match parent_pt.pte(va) {
                        Some(pte) => pte,
                        None => continue,
                    };
                    let mut flags = pte.flags();
                    if flags.contains(PteFlags::WRITE) {
                        flags = (flags - PteFlags::WRITE) | PteFlags::COW;
                        parent_pt.set_pte(va, Pte::new(pte.ppn(), flags));
                    }
                    memory.retain(pte.ppn());
                    pt.map(va, pte.ppn(), flags)?;
                }
                regions.add(region)?;
            }
        }
    }

    trapframe.regs.a0 = 0;
    trapframe.kernel_sp = kstack.base_pa() + PGSIZE;

    let child = Process {
        pid: slot as u32,
        status: ProcStatus::Ready,
        parent: Some(parent_h),
        exit_code: 0,
        waiting: None,
        trapframe,
        kstack,
        pt,
        regions,
        heap,
        files,
        cwd,
        layout,
        symbols,
    };
    Ok(procs.install(slot, child))
}

/// Replace the calling process's program with a fresh image. The pid,
/// parent link and scheduling state survive; the address space, heap,
/// open files and symbol table do not. The single argument string is
/// staged on the new stack with `a0 = argc = 1` and `a1 = argv`.
pub fn do_exec(
    memory: &mut PhysMemory,
    procs: &mut ProcessTable,
    h: ProcHandle,
    image: &[u8],
    arg: &str,
) -> KernelResult<()> {
    let layout = procs.get(h).layout;
    let trap_vector = {
        let proc = procs.get(h);
        let system = proc
            .regions
            .find(SegKind::System)
            .ok_or(KernelError::BadAddress(0))?;
        let pte = proc.pt.pte(system.va).ok_or(KernelError::BadAddress(system.va))?;
        pte.ppn()
    };

    // Build the replacement address space off to the side first, so a
    // corrupt image leaves the caller untouched.
    let mut pt = PageTable::new(memory)?;
    let mut regions = RegionTable::new();

    let tf_frame = memory.alloc_page()?;
    pt.map(tf_frame.base_pa(), tf_frame, PteFlags::READ | PteFlags::WRITE)?;
    regions.add(MappedRegion { va: tf_frame.base_pa(), npages: 1, kind: SegKind::Context })?;

    memory.retain(trap_vector);
    pt.map(trap_vector.base_pa(), trap_vector, PteFlags::READ | PteFlags::EXEC)?;
    regions.add(MappedRegion { va: trap_vector.base_pa(), npages: 1, kind: SegKind::System })?;

    let stack = memory.alloc_page()?;
    let stack_va = layout.stack_top - PGSIZE;
    pt.map(stack_va, stack, PteFlags::READ | PteFlags::WRITE | PteFlags::USER)?;
    regions.add(MappedRegion { va: stack_va, npages: 1, kind: SegKind::Stack })?;

    regions.add(MappedRegion { va: layout.heap_base, npages: 0, kind: SegKind::Heap })?;

    let built = (|| -> KernelResult<(crate::loader::LoadedProgram, u64)> {
        let loaded = crate::loader::load_elf(memory, &mut pt, &mut regions, image)?;

        // Stage argc/argv: the argument string sits just below the stack
        // top, one argv cell under it points at it, and sp lands on the
        // cell. The string is NUL-terminated and bounded by the syscall
        // layer, so it always fits inside the stack page.
        let mut bytes = arg.as_bytes().to_vec();
        bytes.push(0);
        let str_va = (layout.stack_top - bytes.len() as u64) & !7;
        crate::memory::copy_out(memory, &mut pt, str_va, &bytes)?;
        let cell_va = str_va - 8;
        crate::memory::copy_out(memory, &mut pt, cell_va, &str_va.to_le_bytes())?;
        Ok((loaded, cell_va))
    })();
    // a bad image must not leak the scratch address space
    let (loaded, cell_va) = match built {
        Ok(v) => v,
        Err(err) => {
            pt.release(memory);
            return Err(err);
        }
    };

    let kstack = memory.alloc_page()?;
    let proc = procs.get_mut(h);
    let old_pt = core::mem::replace(&mut proc.pt, pt);
    let old_kstack = core::mem::replace(&mut proc.kstack, kstack);
    proc.regions = regions;
    proc.heap = UserHeap::new(layout.heap_base);
    proc.files = FileTable::new();
    proc.symbols = loaded.symbols;
    proc.trapframe = TrapFrame::default();
    proc.trapframe.epc = loaded.entry;
    proc.trapframe.kernel_sp = kstack.base_pa() + PGSIZE;
    proc.trapframe.regs.sp = cell_va;
    proc.trapframe.regs.a0 = 1;
    proc.trapframe.regs.a1 = cell_va;

    old_pt.release(memory);
    memory.release(old_kstack);
    Ok(())
}

/// Mark the calling process a zombie holding `code` for its parent.
pub fn do_exit(procs: &mut ProcessTable, h: ProcHandle, code: i64) {
    let proc = procs.get_mut(h);
    proc.status = ProcStatus::Zombie;
    proc.exit_code = code;
}

/// One attempt at reaping a child. `Retry` means the caller should park
/// itself blocked and try again once a child has exited.
pub fn do_wait(
    memory: &mut PhysMemory,
    procs: &mut ProcessTable,
    h: ProcHandle,
    target: WaitTarget,
) -> WaitOutcome {
    let mut any_child = false;
    let mut zombie = None;
    for child_h in procs.live_handles() {
        let child = procs.get(child_h);
        if child.parent != Some(h) {
            continue;
        }
        if let WaitTarget::Pid(pid) = target {
            if child.pid != pid {
                continue;
            }
        }
        any_child = true;
        if child.status == ProcStatus::Zombie {
            zombie = Some((child_h, child.pid));
            break;
        }
    }
    match (zombie, any_child) {
        (Some((child_h, pid)), _) => {
            procs.reclaim(memory, child_h);
            WaitOutcome::Reaped(pid)
        }
        (None, true) => WaitOutcome::Retry,
        (None, false) => WaitOutcome::NoChild,
    }
}

/// Whether a process blocked in `wait` can now make progress: some child
/// matching its target has become a zombie.
pub fn wait_satisfied(procs: &ProcessTable, h: ProcHandle, target: WaitTarget) -> bool {
    procs.live_handles().iter().any(|&child_h| {
        let child = procs.get(child_h);
        child.parent == Some(h)
            && child.status == ProcStatus::Zombie
            && match target {
                WaitTarget::AnyChild => true,
                WaitTarget::Pid(pid) => child.pid == pid,
            }
    })
}
