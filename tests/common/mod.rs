//! Shared test fixtures: a small ELF64 image builder and machine
//! bring-up helpers. Tests drive the kernel the way trap-handling
//! firmware would, standing in for the user programs themselves.

#![allow(dead_code)]

use rvpk::scheduler::{Dispatch, HartContext};
use rvpk::Kernel;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

struct Segment {
    vaddr: u64,
    flags: u32,
    data: Vec<u8>,
    memsz: u64,
}

/// Builds ELF64 images byte by byte: header, program headers, segment
/// data, then `.symtab`/`.strtab`/`.shstrtab` and the section headers.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<Segment>,
    funcs: Vec<(String, u64)>,
}

impl ElfBuilder {
    pub fn new() -> ElfBuilder {
        ElfBuilder { entry: 0, segments: Vec::new(), funcs: Vec::new() }
    }

    pub fn entry(mut self, entry: u64) -> ElfBuilder {
        self.entry = entry;
        self
    }

    pub fn segment(mut self, vaddr: u64, flags: u32, data: &[u8], memsz: u64) -> ElfBuilder {
        self.segments.push(Segment { vaddr, flags, data: data.to_vec(), memsz });
        self
    }

    pub fn code(self, vaddr: u64, data: &[u8]) -> ElfBuilder {
        let memsz = data.len() as u64;
        self.segment(vaddr, PF_R | PF_X, data, memsz)
    }

    pub fn data_segment(self, vaddr: u64, data: &[u8]) -> ElfBuilder {
        let memsz = data.len() as u64;
        self.segment(vaddr, PF_R | PF_W, data, memsz)
    }

    /// Record a global function symbol for the backtrace table.
    pub fn func(mut self, name: &str, addr: u64) -> ElfBuilder {
        self.funcs.push((name.to_string(), addr));
        self
    }

    pub fn build(self) -> Vec<u8> {
        const EHSIZE: usize = 64;
        const PHENTSIZE: usize = 56;
        const SHENTSIZE: usize = 64;
        const SYMSIZE: usize = 24;

        let phnum = self.segments.len();
        let mut seg_offsets = Vec::new();
        let mut cursor = EHSIZE + phnum * PHENTSIZE;
        for seg in &self.segments {
            seg_offsets.push(cursor);
            cursor += seg.data.len();
        }

        // .strtab: leading NUL, then each function name
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _) in &self.funcs {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        // .symtab: null symbol, then one STB_GLOBAL|STT_FUNC per function
        let mut symtab = vec![0u8; SYMSIZE];
        for ((_, addr), name_off) in self.funcs.iter().zip(&name_offsets) {
            let mut sym = vec![0u8; SYMSIZE];
            sym[0..4].copy_from_slice(&name_off.to_le_bytes());
            sym[4] = 0x12;
            sym[8..16].copy_from_slice(&addr.to_le_bytes());
            symtab.extend_from_slice(&sym);
        }

        let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0".to_vec();

        let symtab_off = cursor;
        let strtab_off = symtab_off + symtab.len();
        let shstrtab_off = strtab_off + strtab.len();
        let shoff = shstrtab_off + shstrtab.len();

        let mut image = vec![0u8; EHSIZE];
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little-endian
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&243u16.to_le_bytes()); // EM_RISCV
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[24..32].copy_from_slice(&self.entry.to_le_bytes());
        image[32..40].copy_from_slice(&(EHSIZE as u64).to_le_bytes()); // phoff
        image[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        image[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes());
        image[54..56].copy_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        image[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());
        image[58..60].copy_from_slice(&(SHENTSIZE as u16).to_le_bytes());
        image[60..62].copy_from_slice(&4u16.to_le_bytes()); // shnum
        image[62..64].copy_from_slice(&3u16.to_le_bytes()); // shstrndx

        for (seg, off) in self.segments.iter().zip(&seg_offsets) {
            let mut ph = vec![0u8; PHENTSIZE];
            ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            ph[4..8].copy_from_slice(&seg.flags.to_le_bytes());
            ph[8..16].copy_from_slice(&(*off as u64).to_le_bytes());
            ph[16..24].copy_from_slice(&seg.vaddr.to_le_bytes());
            ph[32..40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
            ph[40..48].copy_from_slice(&seg.memsz.to_le_bytes());
            ph[48..56].copy_from_slice(&0x1000u64.to_le_bytes());
            image.extend_from_slice(&ph);
        }
        for seg in &self.segments {
            image.extend_from_slice(&seg.data);
        }
        image.extend_from_slice(&symtab);
        image.extend_from_slice(&strtab);
        image.extend_from_slice(&shstrtab);

        // section headers: null, .symtab, .strtab, .shstrtab
        let shdr = |name: u32, sh_type: u32, off: usize, size: usize| {
            let mut sh = vec![0u8; SHENTSIZE];
            sh[0..4].copy_from_slice(&name.to_le_bytes());
            sh[4..8].copy_from_slice(&sh_type.to_le_bytes());
            sh[24..32].copy_from_slice(&(off as u64).to_le_bytes());
            sh[32..40].copy_from_slice(&(size as u64).to_le_bytes());
            sh
        };
        image.extend_from_slice(&shdr(0, 0, 0, 0));
        image.extend_from_slice(&shdr(1, 2, symtab_off, symtab.len()));
        image.extend_from_slice(&shdr(9, 3, strtab_off, strtab.len()));
        image.extend_from_slice(&shdr(17, 3, shstrtab_off, shstrtab.len()));
        image
    }
}

/// A minimal runnable image: one code page at 0x1000.
pub fn simple_image() -> Vec<u8> {
    ElfBuilder::new().entry(0x1000).code(0x1000, &[0x73, 0x00, 0x00, 0x00]).build()
}

/// Bring up a one-hart machine running the given image and schedule it.
pub fn boot(image: Vec<u8>) -> (Kernel, HartContext, u32) {
    let kernel = Kernel::new(256);
    kernel.register_program("/bin/app", image);
    let mut hart = HartContext::new(0);
    let pid = kernel.boot_hart(&hart, "/bin/app").unwrap();
    run_next(&kernel, &mut hart);
    assert_eq!(kernel.current_pid(&hart), Some(pid));
    (kernel, hart, pid)
}

/// Schedule and insist something ran.
pub fn run_next(kernel: &Kernel, hart: &mut HartContext) {
    match kernel.schedule(hart) {
        Dispatch::Run { .. } => {}
        Dispatch::Shutdown => panic!("machine shut down while a test expected a process to run"),
    }
}

/// Stage a NUL-terminated string in a process's memory.
pub fn stage_cstr(kernel: &Kernel, pid: u32, va: u64, s: &str) {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    kernel.write_user(pid, va, &bytes).unwrap();
}
