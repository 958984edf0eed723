use std::collections::HashMap;
use std::fs::File;
use std::mem;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use nix::libc::{Elf32_Ehdr, Elf32_Shdr};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;

pub struct Elf {
    pub path: PathBuf,
    pub file_size: usize,
    pub mmap: Mmap,

    // ELF header
    pub header: Elf32_Ehdr,

    // Section headers
    pub section_headers: Vec<Elf32_Shdr>,
    // Map section name -> index into section_headers
    pub section_map: HashMap<String, usize>,
}

impl Elf {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = File::open(&path_buf)
            .with_context(|| format!("Failed to open {}", path_buf.display()))?;
        let file_size = file.metadata()?.len() as usize;

        // Memory map the whole file as read-only
        let mmap = unsafe { Mmap::map(&file)? };

        if file_size < mem::size_of::<Elf32_Ehdr>() {
            bail!("File too small for ELF header");
        }

        // SAFETY: Elf32_Ehdr is plain old data and the mmap holds at least one header.
        let header: Elf32_Ehdr = unsafe {
            let mut hdr: Elf32_Ehdr = mem::zeroed();
            std::ptr::copy_nonoverlapping(
                mmap.as_ptr(),
                &mut hdr as *mut Elf32_Ehdr as *mut u8,
                mem::size_of::<Elf32_Ehdr>(),
            );
            hdr
        };

        if header.e_ident[..4] != ELF_MAGIC {
            bail!("Not an ELF file");
        }
        if header.e_ident[EI_CLASS] != ELFCLASS32 {
            bail!("Only 32-bit ELF files carry DWARFv1 debug data");
        }
        if header.e_ident[EI_DATA] != ELFDATA2LSB {
            bail!("Only little-endian ELF files are supported");
        }

        let mut elf = Self {
            path: path_buf,
            file_size,
            mmap,
            header,
            section_headers: Vec::new(),
            section_map: HashMap::new(),
        };
        elf.parse_section_headers()?;
        elf.build_section_map();
        Ok(elf)
    }

    fn parse_section_headers(&mut self) -> Result<()> {
        let shoff = self.header.e_shoff as usize;
        let entsize = self.header.e_shentsize as usize;
        let count = self.header.e_shnum as usize;

        if count == 0 || entsize != mem::size_of::<Elf32_Shdr>() {
            bail!("Invalid section header count or size");
        }
        let total = count * entsize;
        if shoff + total > self.file_size {
            bail!("Section header table extends past end of file");
        }

        self.section_headers.resize(count, unsafe { mem::zeroed() });

        // Copy raw bytes out of the mmap; the table is not guaranteed to be aligned.
        unsafe {
            let src = self.mmap.as_ptr().add(shoff);
            let dst = self.section_headers.as_mut_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(src, dst, total);
        }
        Ok(())
    }

    pub fn section_name(&self, section_index: usize) -> Option<&str> {
        let shstrndx = self.header.e_shstrndx as usize;
        if shstrndx >= self.section_headers.len() || section_index >= self.section_headers.len() {
            return None;
        }

        let shstr = &self.section_headers[shstrndx];
        let start = shstr.sh_offset as usize + self.section_headers[section_index].sh_name as usize;
        if start >= self.file_size {
            return None;
        }

        let data = &self.mmap[start..];
        let end = data.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&data[..end]).ok()
    }

    fn build_section_map(&mut self) {
        let mut map = HashMap::new();
        for i in 0..self.section_headers.len() {
            if let Some(name) = self.section_name(i) {
                map.insert(name.to_string(), i);
            }
        }
        self.section_map = map;
    }

    /// Returns the raw bytes of a named section, or None when the section is
    /// absent or its range lies outside the file.
    pub fn section_data(&self, name: &str) -> Option<&[u8]> {
        let &index = self.section_map.get(name)?;
        let section = &self.section_headers[index];
        let start = section.sh_offset as usize;
        let size = section.sh_size as usize;
        if start + size > self.file_size {
            return None;
        }
        Some(&self.mmap[start..start + size])
    }
}
