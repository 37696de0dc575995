use core::fmt;

/// Kernel error taxonomy. Most of these are fatal to the requesting
/// operation: this kernel favors loud termination over recovery, and the
/// embedding machine is expected to halt when a fatal error escapes a trap
/// handler. The recoverable conditions (`NoSuchChild`, the file errors,
/// a missing exec target) surface to user programs as negative syscall
/// return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Malformed ELF image (bad magic, class, or header layout).
    InvalidFormat,
    /// A loadable ELF segment fails validation (filesz/memsz, overflow,
    /// unknown flag combination, overlapping range).
    CorruptSegment,
    /// The process table is full.
    OutOfProcesses,
    /// The physical page allocator is exhausted.
    OutOfMemory,
    /// The mapped-region table of a process is full.
    TooManyRegions,
    /// `free`/`free_page` called with an address that owns no allocation.
    NothingToFree,
    /// `wait` called with no matching child.
    NoSuchChild,
    /// The semaphore table is full.
    TooManySemaphores,
    /// P/V on a semaphore id that was never created.
    InvalidSemaphore,
    /// A path that names no host file or directory.
    NoSuchFile,
    /// A file descriptor that is closed or of the wrong kind.
    BadFileDescriptor,
    /// The per-process file table is full.
    TooManyFiles,
    /// Syscall number outside the dispatch table.
    UnknownSyscall(u64),
    /// A user virtual address that is unmapped or lacks the required
    /// permission.
    BadAddress(u64),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::InvalidFormat => write!(f, "invalid ELF image"),
            KernelError::CorruptSegment => write!(f, "corrupt ELF segment"),
            KernelError::OutOfProcesses => write!(f, "cannot find any free process structure"),
            KernelError::OutOfMemory => write!(f, "physical memory exhausted"),
            KernelError::TooManyRegions => write!(f, "mapped-region table full"),
            KernelError::NothingToFree => write!(f, "nothing to free"),
            KernelError::NoSuchChild => write!(f, "no such child process"),
            KernelError::TooManySemaphores => write!(f, "too many semaphores"),
            KernelError::InvalidSemaphore => write!(f, "invalid semaphore id"),
            KernelError::NoSuchFile => write!(f, "no such file or directory"),
            KernelError::BadFileDescriptor => write!(f, "bad file descriptor"),
            KernelError::TooManyFiles => write!(f, "per-process file table full"),
            KernelError::UnknownSyscall(n) => write!(f, "unknown syscall {}", n),
            KernelError::BadAddress(va) => write!(f, "bad user address {:#x}", va),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
