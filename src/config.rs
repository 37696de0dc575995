//! Kernel-wide configuration: table capacities and the fixed user-visible
//! memory layout. The layout mirrors the classic proxy-kernel map: the user
//! stack grows down from a fixed top, the free (heap) area grows up from a
//! fixed base, and each hardware thread gets its own window offset by a
//! fixed stride.

/// Size of one physical/virtual page.
pub const PGSIZE: u64 = 4096;
/// log2(PGSIZE).
pub const PGSHIFT: u64 = 12;

/// Start of emulated physical memory (RISC-V DRAM base).
pub const DRAM_BASE: u64 = 0x8000_0000;

/// Default number of physical page frames the emulated machine owns.
pub const PHYS_PAGES_DEFAULT: usize = 1024;

/// Maximum number of processes the table can hold.
pub const NPROC: usize = 32;

/// Maximum number of hardware threads.
pub const NCPU: usize = 8;

/// Maximum number of semaphores over the kernel lifetime.
pub const SEM_MAX: usize = 32;

/// Capacity of a process's mapped-region table.
pub const MAX_MAPPED_REGIONS: usize = 16;

/// Capacity of a process's heap-block descriptor table. One page worth of
/// 32-byte descriptors, minus the sentinel slot, as in the original layout.
pub const MAX_HEAP_BLOCKS: usize = 127;

/// Capacity of a process's open-file table.
pub const MAX_FILES: usize = 16;

/// Virtual address of the user stack top for hart 0.
pub const USER_STACK_TOP: u64 = 0x7fff_f000;

/// Start of the user free-memory (heap) area for hart 0.
pub const USER_FREE_ADDRESS_START: u64 = 0x7f00_0000;

/// Per-hart offset applied to the user stack top and heap base, so that
/// programs loaded on different harts occupy disjoint layout windows.
pub const HART_STRIDE: u64 = 0x0100_0000;

/// User stack top for the given hart.
pub fn user_stack_top(hart: usize) -> u64 {
    USER_STACK_TOP - hart as u64 * HART_STRIDE
}

/// User heap base for the given hart.
pub fn user_heap_base(hart: usize) -> u64 {
    USER_FREE_ADDRESS_START - hart as u64 * HART_STRIDE
}
