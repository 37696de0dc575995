use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::PGSIZE;
use crate::error::{KernelError, KernelResult};
use crate::memory::{copy_out, PageTable, PhysMemory, PteFlags};
use crate::process::{MappedRegion, RegionTable, SegKind};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;
const SHT_SYMTAB: u32 = 2;
/// STB_GLOBAL << 4 | STT_FUNC, the only symbols the backtracer wants.
const GLOBAL_FUNC_INFO: u8 = 0x12;

bitflags! {
    /// Program-header permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXEC  = 1;
        const WRITE = 2;
        const READ  = 4;
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
    e_shoff: u64,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> KernelResult<Elf64Ehdr> {
        if data.len() < 64 {
            return Err(KernelError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(KernelError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(KernelError::InvalidFormat);
        }
        Ok(Elf64Ehdr {
            e_entry: read_u64(data, 24),
            e_phoff: read_u64(data, 32),
            e_phentsize: read_u16(data, 54),
            e_phnum: read_u16(data, 56),
            e_shoff: read_u64(data, 40),
            e_shentsize: read_u16(data, 58),
            e_shnum: read_u16(data, 60),
            e_shstrndx: read_u16(data, 62),
        })
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> KernelResult<Elf64Phdr> {
        if data.len() < 56 {
            return Err(KernelError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: read_u32(data, 0),
            p_flags: read_u32(data, 4),
            p_offset: read_u64(data, 8),
            p_vaddr: read_u64(data, 16),
            p_filesz: read_u64(data, 32),
            p_memsz: read_u64(data, 40),
        })
    }
}

struct Elf64Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_offset: u64,
    sh_size: u64,
}

impl Elf64Shdr {
    fn parse(data: &[u8]) -> KernelResult<Elf64Shdr> {
        if data.len() < 64 {
            return Err(KernelError::InvalidFormat);
        }
        Ok(Elf64Shdr {
            sh_name: read_u32(data, 0),
            sh_type: read_u32(data, 4),
            sh_offset: read_u64(data, 24),
            sh_size: read_u64(data, 32),
        })
    }
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(bytes)
}

/// Entry `index` of a header table at file offset `base`. All of the
/// arithmetic is checked; a table that runs off the file (or whose
/// offsets wrap) yields `None` instead of a panic.
fn table_entry(image: &[u8], base: u64, index: usize, entsize: u64, len: usize) -> Option<&[u8]> {
    let off = base.checked_add((index as u64).checked_mul(entsize)?)?;
    let off = usize::try_from(off).ok()?;
    image.get(off..off.checked_add(len)?)
}

fn section_bytes<'a>(image: &'a [u8], sh: &Elf64Shdr) -> Option<&'a [u8]> {
    let off = usize::try_from(sh.sh_offset).ok()?;
    let len = usize::try_from(sh.sh_size).ok()?;
    image.get(off..off.checked_add(len)?)
}

// ══════════════════════════════════════════════════════════════
//  Loader
// ══════════════════════════════════════════════════════════════

/// A global function symbol extracted from `.symtab`, used by the
/// stack-walking backtrace syscall.
#[derive(Debug, Clone)]
pub struct FuncSymbol {
    pub addr: u64,
    pub name: String,
}

/// What loading an image produced: the entry point for the trap frame and
/// the function symbols sorted by descending address.
pub struct LoadedProgram {
    pub entry: u64,
    pub symbols: Vec<FuncSymbol>,
}

/// Load an ELF image into an address space. For every LOAD segment this
/// allocates the smallest whole number of pages covering `memsz`, zeroes
/// them, maps them user-RWX, copies `filesz` bytes from the file, and
/// records a mapped region whose kind comes from the segment flag bits
/// (R|X code, R|W data; anything else is a corrupt image).
pub fn load_elf(
    memory: &mut PhysMemory,
    pt: &mut PageTable,
    regions: &mut RegionTable,
    image: &[u8],
) -> KernelResult<LoadedProgram> {
    let ehdr = Elf64Ehdr::parse(image)?;

    for i in 0..ehdr.e_phnum as usize {
        let bytes = table_entry(image, ehdr.e_phoff, i, ehdr.e_phentsize as u64, 56)
            .ok_or(KernelError::InvalidFormat)?;
        let ph = Elf64Phdr::parse(bytes)?;
        if ph.p_type != PT_LOAD {
            continue;
        }

        if ph.p_memsz < ph.p_filesz {
            return Err(KernelError::CorruptSegment);
        }
        if ph.p_vaddr.checked_add(ph.p_memsz).is_none() {
            return Err(KernelError::CorruptSegment);
        }

        let kind = match SegmentFlags::from_bits_truncate(ph.p_flags) {
            f if f == SegmentFlags::READ | SegmentFlags::EXEC => SegKind::Code,
            f if f == SegmentFlags::READ | SegmentFlags::WRITE => SegKind::Data,
            _ => return Err(KernelError::CorruptSegment),
        };

        // Smallest page multiple covering the segment; a zero-size segment
        // still claims one page, as the original loader did.
        let npages = (ph.p_memsz.max(1) + PGSIZE - 1) / PGSIZE;
        for page in 0..npages {
            let frame = memory.alloc_page()?;
            pt.map(
                ph.p_vaddr + page * PGSIZE,
                frame,
                PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC | PteFlags::USER,
            )
            .map_err(|_| KernelError::CorruptSegment)?;
        }

        let file_end = ph.p_offset.checked_add(ph.p_filesz).ok_or(KernelError::CorruptSegment)?;
        let src = image
            .get(ph.p_offset as usize..file_end as usize)
            .ok_or(KernelError::CorruptSegment)?;
        copy_out(memory, pt, ph.p_vaddr, src)?;

        regions.add(MappedRegion { va: ph.p_vaddr, npages, kind })?;
    }

    let symbols = load_func_symbols(image, &ehdr);
    Ok(LoadedProgram { entry: ehdr.e_entry, symbols })
}

/// Scan the section headers for `.symtab`/`.strtab` and pull out the global
/// function symbols, sorted by descending address. Images without symbol
/// sections simply yield an empty table; backtraces then print nothing.
fn load_func_symbols(image: &[u8], ehdr: &Elf64Ehdr) -> Vec<FuncSymbol> {
    let mut symbols = Vec::new();
    if ehdr.e_shoff == 0 || ehdr.e_shnum == 0 {
        return symbols;
    }
    let shdr_at = |index: usize| -> Option<Elf64Shdr> {
        Elf64Shdr::parse(table_entry(image, ehdr.e_shoff, index, ehdr.e_shentsize as u64, 64)?).ok()
    };

    let shstr = match shdr_at(ehdr.e_shstrndx as usize) {
        Some(sh) => sh,
        None => return symbols,
    };
    let shstr_bytes = match section_bytes(image, &shstr) {
        Some(b) => b,
        None => return symbols,
    };

    let mut symtab = None;
    let mut strtab = None;
    for i in 0..ehdr.e_shnum as usize {
        let sh = match shdr_at(i) {
            Some(sh) => sh,
            None => return symbols,
        };
        match cstr_at(shstr_bytes, sh.sh_name as usize) {
            Some(".symtab") if sh.sh_type == SHT_SYMTAB => symtab = Some(sh),
            Some(".strtab") => strtab = Some(sh),
            _ => {}
        }
    }
    let (symtab, strtab) = match (symtab, strtab) {
        (Some(s), Some(t)) => (s, t),
        _ => return symbols,
    };
    let str_bytes = match section_bytes(image, &strtab) {
        Some(b) => b,
        None => return symbols,
    };

    const SYM_SIZE: usize = 24;
    let count = symtab.sh_size as usize / SYM_SIZE;
    for i in 0..count {
        let entry = match table_entry(image, symtab.sh_offset, i, SYM_SIZE as u64, SYM_SIZE) {
            Some(e) => e,
            None => break,
        };
        let name_off = read_u32(entry, 0);
        let info = entry[4];
        let value = read_u64(entry, 8);
        if name_off == 0 || info != GLOBAL_FUNC_INFO {
            continue;
        }
        if let Some(name) = cstr_at(str_bytes, name_off as usize) {
            symbols.push(FuncSymbol { addr: value, name: String::from(name) });
        }
    }

    symbols.sort_unstable_by(|a, b| b.addr.cmp(&a.addr));
    symbols
}

fn cstr_at(bytes: &[u8], off: usize) -> Option<&str> {
    let tail = bytes.get(off..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&tail[..end]).ok()
}
