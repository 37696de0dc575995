use alloc::vec::Vec;

use crate::config::{MAX_HEAP_BLOCKS, PGSIZE};
use crate::error::{KernelError, KernelResult};

/// Allocation state of one heap descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMark {
    #[default]
    Unused,
    Allocated,
    Free,
}

/// One block of user heap memory tracked by the in-kernel allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapBlock {
    pub va: u64,
    pub size: u64,
    pub mark: BlockMark,
}

/// The per-process user heap manager. Block bookkeeping lives in the kernel
/// (a fixed descriptor table, like the rest of the PCB) while the bytes
/// themselves live in user pages mapped on demand. The heap grows upward
/// from its base one page multiple at a time; whole pages handed back via
/// `give_page` are remembered and reused before the heap grows again.
#[derive(Debug, Clone)]
pub struct UserHeap {
    base: u64,
    next_page: u64,
    free_pages: Vec<u64>,
    blocks: [HeapBlock; MAX_HEAP_BLOCKS],
}

impl UserHeap {
    pub fn new(base: u64) -> UserHeap {
        UserHeap {
            base,
            next_page: base,
            free_pages: Vec::new(),
            blocks: [HeapBlock::default(); MAX_HEAP_BLOCKS],
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// First virtual address past everything the heap has ever claimed.
    pub fn top(&self) -> u64 {
        self.next_page
    }

    /// Number of pages between base and top, holes included.
    pub fn span_pages(&self) -> u64 {
        (self.next_page - self.base) / PGSIZE
    }

    /// Allocate `size` bytes, first fit over the free blocks. When no free
    /// block is large enough the heap grows by the smallest page multiple
    /// covering the request; `map_pages(va, npages)` is the caller's hook
    /// for actually mapping the new pages.
    pub fn alloc(
        &mut self,
        size: u64,
        map_pages: impl FnOnce(u64, u64) -> KernelResult<()>,
    ) -> KernelResult<u64> {
        let need = (size.max(1) + 7) & !7;
        if let Some(va) = self.take_from_free(need)? {
            return Ok(va);
        }
        let npages = (need + PGSIZE - 1) / PGSIZE;
        let grow_va = self.next_page;
        map_pages(grow_va, npages)?;
        self.next_page += npages * PGSIZE;
        self.install_free(grow_va, npages * PGSIZE)?;
        self.take_from_free(need)?.ok_or(KernelError::OutOfMemory)
    }

    /// Release the block starting exactly at `va`. A free block that starts
    /// right where this one ends absorbs it; otherwise the freed descriptor
    /// is rotated to the front of the table so the next scan sees it early.
    pub fn free(&mut self, va: u64) -> KernelResult<()> {
        let idx = self
            .blocks
            .iter()
            .position(|b| b.mark == BlockMark::Allocated && b.va == va)
            .ok_or(KernelError::NothingToFree)?;
        let size = self.blocks[idx].size;
        self.blocks[idx].mark = BlockMark::Free;

        let next = self
            .blocks
            .iter()
            .position(|b| b.mark == BlockMark::Free && b.va == va + size)
            .filter(|&j| j != idx);
        match next {
            Some(j) => {
                self.blocks[j].va = va;
                self.blocks[j].size += size;
                self.blocks[idx] = HeapBlock::default();
            }
            None => self.blocks.swap(0, idx),
        }
        Ok(())
    }

    /// Hand out one page-aligned address for an explicit page allocation,
    /// reusing a previously returned page when one exists. The caller maps
    /// the page.
    pub fn take_page(&mut self) -> u64 {
        if let Some(va) = self.free_pages.pop() {
            return va;
        }
        let va = self.next_page;
        self.next_page += PGSIZE;
        va
    }

    /// Record an explicitly freed page for later reuse. The caller unmaps
    /// it; a page outside the heap span or already on the free list is a
    /// caller error.
    pub fn give_page(&mut self, va: u64) -> KernelResult<()> {
        if va % PGSIZE != 0 || va < self.base || va >= self.next_page {
            return Err(KernelError::BadAddress(va));
        }
        if self.free_pages.contains(&va) {
            return Err(KernelError::NothingToFree);
        }
        self.free_pages.push(va);
        Ok(())
    }

    pub fn free_page_list(&self) -> &[u64] {
        &self.free_pages
    }

    fn take_from_free(&mut self, need: u64) -> KernelResult<Option<u64>> {
        let idx = match self
            .blocks
            .iter()
            .position(|b| b.mark == BlockMark::Free && b.size >= need)
        {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let va = self.blocks[idx].va;
        if self.blocks[idx].size == need {
            // exact fit: the free descriptor becomes the allocation
            self.blocks[idx].mark = BlockMark::Allocated;
            return Ok(Some(va));
        }
        self.blocks[idx].va += need;
        self.blocks[idx].size -= need;
        let slot = self.unused_slot()?;
        self.blocks[slot] = HeapBlock { va, size: need, mark: BlockMark::Allocated };
        Ok(Some(va))
    }

    fn install_free(&mut self, va: u64, size: u64) -> KernelResult<()> {
        let slot = self.unused_slot()?;
        self.blocks[slot] = HeapBlock { va, size, mark: BlockMark::Free };
        Ok(())
    }

    fn unused_slot(&self) -> KernelResult<usize> {
        self.blocks
            .iter()
            .position(|b| b.mark == BlockMark::Unused)
            .ok_or(KernelError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_grow(_va: u64, _npages: u64) -> KernelResult<()> {
        Ok(())
    }

    #[test]
    fn alloc_rounds_and_reuses_freed_block() {
        let mut heap = UserHeap::new(0x7f00_0000);
        let a = heap.alloc(10, no_grow).unwrap();
        assert_eq!(a, 0x7f00_0000);
        let b = heap.alloc(16, no_grow).unwrap();
        assert_eq!(b, a + 16); // 10 rounds up to 16
        heap.free(a).unwrap();
        let c = heap.alloc(8, no_grow).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn grows_by_whole_pages() {
        let mut heap = UserHeap::new(0x7f00_0000);
        let mut grown = Vec::new();
        heap.alloc(PGSIZE + 1, |va, n| {
            grown.push((va, n));
            Ok(())
        })
        .unwrap();
        assert_eq!(grown, alloc::vec![(0x7f00_0000, 2)]);
        assert_eq!(heap.span_pages(), 2);
    }

    #[test]
    fn free_unknown_address_is_an_error() {
        let mut heap = UserHeap::new(0x7f00_0000);
        let a = heap.alloc(32, no_grow).unwrap();
        assert!(matches!(heap.free(a + 8), Err(KernelError::NothingToFree)));
        heap.free(a).unwrap();
        assert!(matches!(heap.free(a), Err(KernelError::NothingToFree)));
    }

    #[test]
    fn adjacent_free_blocks_coalesce() {
        let mut heap = UserHeap::new(0x7f00_0000);
        let a = heap.alloc(64, no_grow).unwrap();
        let b = heap.alloc(64, no_grow).unwrap();
        heap.free(b).unwrap();
        heap.free(a).unwrap();
        // both blocks merged, so a 128-byte request fits without growing
        let c = heap
            .alloc(128, |_, _| Err(KernelError::OutOfMemory))
            .unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn exact_fit_takes_over_the_free_descriptor() {
        let mut heap = UserHeap::new(0x7f00_0000);
        // every page-sized request is an exact fit against the block it
        // grew, so each live allocation costs exactly one descriptor and
        // the table can fill completely
        for i in 0..MAX_HEAP_BLOCKS as u64 {
            let va = heap.alloc(PGSIZE, no_grow).unwrap();
            assert_eq!(va, 0x7f00_0000 + i * PGSIZE);
        }
    }

    #[test]
    fn page_list_reuses_before_growing() {
        let mut heap = UserHeap::new(0x7f00_0000);
        let p0 = heap.take_page();
        let p1 = heap.take_page();
        assert_eq!(p1, p0 + PGSIZE);
        heap.give_page(p0).unwrap();
        assert!(matches!(heap.give_page(p0), Err(KernelError::NothingToFree)));
        assert_eq!(heap.take_page(), p0);
        assert!(matches!(heap.give_page(0x1000), Err(KernelError::BadAddress(_))));
    }
}
