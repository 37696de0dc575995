use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::{DRAM_BASE, PGSHIFT, PGSIZE};
use crate::error::{KernelError, KernelResult};

/// A physical page number. The first frame of the emulated machine sits at
/// the RISC-V DRAM base, so `base_pa` values look like real physical
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysPageNum(pub u64);

impl PhysPageNum {
    /// Physical address of the first byte of this frame.
    pub fn base_pa(self) -> u64 {
        self.0 << PGSHIFT
    }

    /// Page number containing the given physical address.
    pub fn containing(pa: u64) -> PhysPageNum {
        PhysPageNum(pa >> PGSHIFT)
    }
}

struct Frame {
    data: Box<[u8]>,
    refs: u32,
}

/// The physical memory of the emulated machine: a fixed-capacity arena of
/// 4 KiB frames. Every live frame carries a reference count so that code
/// sharing and copy-on-write heap sharing across `fork` are explicit; a
/// frame is returned to the free list when its last reference is released.
pub struct PhysMemory {
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
    capacity: usize,
}

impl PhysMemory {
    pub fn new(capacity: usize) -> PhysMemory {
        PhysMemory { frames: Vec::new(), free: Vec::new(), capacity }
    }

    fn index(ppn: PhysPageNum) -> usize {
        (ppn.0 - (DRAM_BASE >> PGSHIFT)) as usize
    }

    fn ppn(index: usize) -> PhysPageNum {
        PhysPageNum((DRAM_BASE >> PGSHIFT) + index as u64)
    }

    fn frame(&self, ppn: PhysPageNum) -> &Frame {
        self.frames
            .get(Self::index(ppn))
            .and_then(|f| f.as_ref())
            .unwrap_or_else(|| panic!("frame {:#x} is not resident", ppn.0))
    }

    fn frame_mut(&mut self, ppn: PhysPageNum) -> &mut Frame {
        self.frames
            .get_mut(Self::index(ppn))
            .and_then(|f| f.as_mut())
            .unwrap_or_else(|| panic!("frame {:#x} is not resident", ppn.0))
    }

    /// Allocate one zeroed page, reference count 1.
    pub fn alloc_page(&mut self) -> KernelResult<PhysPageNum> {
        let data = vec![0u8; PGSIZE as usize].into_boxed_slice();
        let frame = Frame { data, refs: 1 };
        if let Some(index) = self.free.pop() {
            self.frames[index] = Some(frame);
            return Ok(Self::ppn(index));
        }
        if self.frames.len() >= self.capacity {
            return Err(KernelError::OutOfMemory);
        }
        self.frames.push(Some(frame));
        Ok(Self::ppn(self.frames.len() - 1))
    }

    /// Add one reference to an already-resident frame (sharing).
    pub fn retain(&mut self, ppn: PhysPageNum) {
        self.frame_mut(ppn).refs += 1;
    }

    /// Drop one reference; the frame is reclaimed when the count hits zero.
    pub fn release(&mut self, ppn: PhysPageNum) {
        let index = Self::index(ppn);
        let refs = {
            let frame = self.frame_mut(ppn);
            frame.refs -= 1;
            frame.refs
        };
        if refs == 0 {
            self.frames[index] = None;
            self.free.push(index);
        }
    }

    pub fn ref_count(&self, ppn: PhysPageNum) -> u32 {
        self.frame(ppn).refs
    }

    /// Number of resident frames (diagnostics).
    pub fn resident_pages(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    pub fn page(&self, ppn: PhysPageNum) -> &[u8] {
        &self.frame(ppn).data
    }

    pub fn page_mut(&mut self, ppn: PhysPageNum) -> &mut [u8] {
        &mut self.frame_mut(ppn).data
    }

    /// Byte-copy one whole frame into another.
    pub fn copy_page(&mut self, src: PhysPageNum, dst: PhysPageNum) {
        let data = self.frame(src).data.clone();
        self.frame_mut(dst).data.copy_from_slice(&data);
    }
}
