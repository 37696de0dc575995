use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;

use bit_field::BitField;
use bitflags::bitflags;

use crate::config::{PGSHIFT, PGSIZE};
use crate::error::{KernelError, KernelResult};

use super::frame_allocator::{PhysMemory, PhysPageNum};

bitflags! {
    /// RISC-V style PTE permission bits. `COW` lives in the first
    /// reserved-for-software bit, marking a page shared copy-on-write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
        const COW      = 1 << 8;
    }
}

/// One page-table entry, packed the Sv39 way: permission bits in the low
/// ten bits, the physical page number in bits 10..54.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub fn new(ppn: PhysPageNum, flags: PteFlags) -> Pte {
        let mut raw: u64 = flags.bits();
        raw.set_bits(10..54, ppn.0);
        Pte(raw)
    }

    pub fn ppn(self) -> PhysPageNum {
        PhysPageNum(self.0.get_bits(10..54))
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0.get_bits(0..10))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A process's address-translation structure. The root frame is owned (it
/// is what the satp register would point at); the translation itself is a
/// software map from virtual page number to PTE, which is all an emulated
/// machine needs and keeps every walk host-testable.
pub struct PageTable {
    root: PhysPageNum,
    entries: BTreeMap<u64, Pte>,
}

impl PageTable {
    pub fn new(memory: &mut PhysMemory) -> KernelResult<PageTable> {
        let root = memory.alloc_page()?;
        Ok(PageTable { root, entries: BTreeMap::new() })
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root
    }

    /// satp value for this address space: Sv39 mode in the top nibble, root
    /// PPN in the low bits.
    pub fn make_satp(&self) -> u64 {
        let mut satp: u64 = 0;
        satp.set_bits(60..64, 8); // Sv39
        satp.set_bits(0..44, self.root.0);
        satp
    }

    /// Install a translation for the page containing `va`. Each virtual page
    /// maps at most once; a double map is a kernel bug surfaced as
    /// `BadAddress`.
    pub fn map(&mut self, va: u64, ppn: PhysPageNum, flags: PteFlags) -> KernelResult<()> {
        let vpn = va >> PGSHIFT;
        if self.entries.contains_key(&vpn) {
            return Err(KernelError::BadAddress(va));
        }
        self.entries.insert(vpn, Pte::new(ppn, flags | PteFlags::VALID));
        Ok(())
    }

    /// Remove the translation for the page containing `va`.
    pub fn unmap(&mut self, va: u64) -> Option<Pte> {
        self.entries.remove(&(va >> PGSHIFT))
    }

    pub fn pte(&self, va: u64) -> Option<Pte> {
        self.entries.get(&(va >> PGSHIFT)).copied()
    }

    /// Rewrite the translation for an already-mapped page (COW resolution).
    pub fn set_pte(&mut self, va: u64, pte: Pte) {
        self.entries.insert(va >> PGSHIFT, pte);
    }

    /// Physical address backing `va`, if mapped and valid.
    pub fn lookup_pa(&self, va: u64) -> Option<u64> {
        let pte = self.pte(va)?;
        if !pte.flags().contains(PteFlags::VALID) {
            return None;
        }
        Some(pte.ppn().base_pa() + (va & (PGSIZE - 1)))
    }

    /// All live translations as (page virtual address, PTE) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u64, Pte)> + '_ {
        self.entries.iter().map(|(vpn, pte)| (vpn << PGSHIFT, *pte))
    }

    /// Tear down the address space, dropping one reference per mapped frame
    /// plus the root frame.
    pub fn release(self, memory: &mut PhysMemory) {
        for (_, pte) in self.entries.iter() {
            memory.release(pte.ppn());
        }
        memory.release(self.root);
    }
}

/// Make the page containing `va` writable, applying the copy-on-write
/// contract: a COW page whose frame is shared gets a private copy and a
/// rewritten mapping; a COW page down to its last reference just regains
/// the write bit. Returns the (possibly new) backing frame.
pub fn ensure_writable(
    memory: &mut PhysMemory,
    pt: &mut PageTable,
    va: u64,
) -> KernelResult<PhysPageNum> {
    let page_va = va & !(PGSIZE - 1);
    let pte = pt.pte(page_va).ok_or(KernelError::BadAddress(va))?;
    let flags = pte.flags();
    if !flags.contains(PteFlags::VALID) {
        return Err(KernelError::BadAddress(va));
    }
    if flags.contains(PteFlags::WRITE) {
        return Ok(pte.ppn());
    }
    if !flags.contains(PteFlags::COW) {
        return Err(KernelError::BadAddress(va));
    }
    let resolved = (flags - PteFlags::COW) | PteFlags::WRITE;
    let old = pte.ppn();
    if memory.ref_count(old) == 1 {
        pt.set_pte(page_va, Pte::new(old, resolved));
        return Ok(old);
    }
    let fresh = memory.alloc_page()?;
    memory.copy_page(old, fresh);
    memory.release(old);
    pt.set_pte(page_va, Pte::new(fresh, resolved));
    Ok(fresh)
}

/// Copy bytes out of kernel space into a user address range (kernel-side
/// write; resolves COW but does not require the USER bit).
pub fn copy_out(
    memory: &mut PhysMemory,
    pt: &mut PageTable,
    mut va: u64,
    data: &[u8],
) -> KernelResult<()> {
    let mut done = 0usize;
    while done < data.len() {
        let page_va = va & !(PGSIZE - 1);
        let off = (va - page_va) as usize;
        let n = core::cmp::min(data.len() - done, PGSIZE as usize - off);
        let ppn = ensure_writable(memory, pt, page_va)?;
        memory.page_mut(ppn)[off..off + n].copy_from_slice(&data[done..done + n]);
        done += n;
        va += n as u64;
    }
    Ok(())
}

/// Copy bytes from a user address range into a kernel buffer.
pub fn copy_in(
    memory: &PhysMemory,
    pt: &PageTable,
    mut va: u64,
    buf: &mut [u8],
) -> KernelResult<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let page_va = va & !(PGSIZE - 1);
        let off = (va - page_va) as usize;
        let n = core::cmp::min(buf.len() - done, PGSIZE as usize - off);
        let pte = pt.pte(page_va).ok_or(KernelError::BadAddress(va))?;
        if !pte.flags().contains(PteFlags::VALID | PteFlags::READ) {
            return Err(KernelError::BadAddress(va));
        }
        buf[done..done + n].copy_from_slice(&memory.page(pte.ppn())[off..off + n]);
        done += n;
        va += n as u64;
    }
    Ok(())
}

/// Read a NUL-terminated string from user space, bounded by `max` bytes.
pub fn copy_in_cstr(
    memory: &PhysMemory,
    pt: &PageTable,
    va: u64,
    max: usize,
) -> KernelResult<String> {
    let mut bytes = vec![0u8; max];
    let mut len = 0usize;
    while len < max {
        let mut byte = [0u8; 1];
        copy_in(memory, pt, va + len as u64, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes[len] = byte[0];
        len += 1;
    }
    bytes.truncate(len);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// A store issued from user mode: requires the USER bit, then behaves like
/// a hardware store that may take (and transparently resolve) a COW write
/// fault.
pub fn user_store(
    memory: &mut PhysMemory,
    pt: &mut PageTable,
    mut va: u64,
    data: &[u8],
) -> KernelResult<()> {
    let mut done = 0usize;
    while done < data.len() {
        let page_va = va & !(PGSIZE - 1);
        let off = (va - page_va) as usize;
        let n = core::cmp::min(data.len() - done, PGSIZE as usize - off);
        let pte = pt.pte(page_va).ok_or(KernelError::BadAddress(va))?;
        if !pte.flags().contains(PteFlags::VALID | PteFlags::USER) {
            return Err(KernelError::BadAddress(va));
        }
        let ppn = ensure_writable(memory, pt, page_va)?;
        memory.page_mut(ppn)[off..off + n].copy_from_slice(&data[done..done + n]);
        done += n;
        va += n as u64;
    }
    Ok(())
}
