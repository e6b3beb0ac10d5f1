//! Synthetic ELF64 images for tests.
//!
//! [`ElfBuilder`] lays out a little-endian ELF64 file: header, program
//! header table, segment contents, section contents, the section-name
//! string table, then the section header table.

use core::mem::size_of;

use crate::elf::{
    Elf64Header, Elf64ProgramHeader, Elf64SectionHeader, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC,
    EM_X86_64, EV_CURRENT, PT_LOAD, SHN_XINDEX, SHT_NOBITS, SHT_STRTAB,
};

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

#[derive(Debug, Clone)]
struct SegmentSpec {
    p_type: u32,
    flags: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

#[derive(Debug, Clone)]
struct SectionSpec {
    name: String,
    sh_type: u32,
    flags: u64,
    addr: u64,
    data: Vec<u8>,
    size: u64,
}

/// Builder for an in-memory ELF64 file.
#[derive(Debug, Clone)]
pub struct ElfBuilder {
    e_type: u16,
    machine: u16,
    entry: u64,
    segments: Vec<SegmentSpec>,
    sections: Vec<SectionSpec>,
    section_names: bool,
    extended: bool,
}

impl ElfBuilder {
    /// Static executable (`ET_EXEC`) entering at `entry`.
    pub fn executable(entry: u64) -> Self {
        Self::with_type(ET_EXEC, entry)
    }

    /// Shared object / PIE (`ET_DYN`) entering at `entry`.
    pub fn shared(entry: u64) -> Self {
        Self::with_type(ET_DYN, entry)
    }

    fn with_type(e_type: u16, entry: u64) -> Self {
        Self {
            e_type,
            machine: crate::elf::host_machine().unwrap_or(EM_X86_64),
            entry,
            segments: Vec::new(),
            sections: Vec::new(),
            section_names: true,
            extended: false,
        }
    }

    /// Append a program header of any type.
    pub fn segment(mut self, p_type: u32, flags: u32, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segments.push(SegmentSpec {
            p_type,
            flags,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// Append a `PT_LOAD` program header.
    pub fn load(self, flags: u32, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segment(PT_LOAD, flags, vaddr, data, memsz)
    }

    /// Append a section with file contents.
    pub fn section(mut self, name: &str, sh_type: u32, flags: u64, addr: u64, data: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type,
            flags,
            addr,
            data: data.to_vec(),
            size: data.len() as u64,
        });
        self
    }

    /// Append an `SHT_NOBITS` section of `size` bytes.
    pub fn nobits(mut self, name: &str, flags: u64, addr: u64, size: u64) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type: SHT_NOBITS,
            flags,
            addr,
            data: Vec::new(),
            size,
        });
        self
    }

    /// Leave out `.shstrtab` and set `e_shstrndx` to `SHN_UNDEF`.
    pub fn without_section_names(mut self) -> Self {
        self.section_names = false;
        self
    }

    /// Store the section count and name index in section 0.
    pub fn extended_numbering(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Lay out the file.
    pub fn build(&self) -> Vec<u8> {
        let ehsize = size_of::<Elf64Header>();
        let phentsize = size_of::<Elf64ProgramHeader>();
        let shentsize = size_of::<Elf64SectionHeader>();

        let mut file = vec![0u8; ehsize + phentsize * self.segments.len()];

        let mut phdrs = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            let offset = append_aligned(&mut file, &seg.data, 16);
            phdrs.push(Elf64ProgramHeader {
                p_type: seg.p_type,
                p_flags: seg.flags,
                p_offset: offset,
                p_vaddr: seg.vaddr,
                p_paddr: seg.vaddr,
                p_filesz: seg.data.len() as u64,
                p_memsz: seg.memsz,
                p_align: 0x1000,
            });
        }

        let mut names = vec![0u8];
        let mut shdrs = vec![Elf64SectionHeader::default()];
        for sec in &self.sections {
            let sh_name = push_name(&mut names, &sec.name);
            let offset = append_aligned(&mut file, &sec.data, 16);
            shdrs.push(Elf64SectionHeader {
                sh_name,
                sh_type: sec.sh_type,
                sh_flags: sec.flags,
                sh_addr: sec.addr,
                sh_offset: offset,
                sh_size: sec.size,
                sh_addralign: 16,
                ..Default::default()
            });
        }

        let mut shstrndx = 0u16;
        if self.section_names {
            let sh_name = push_name(&mut names, ".shstrtab");
            let offset = append_aligned(&mut file, &names, 1);
            shstrndx = shdrs.len() as u16;
            shdrs.push(Elf64SectionHeader {
                sh_name,
                sh_type: SHT_STRTAB,
                sh_offset: offset,
                sh_size: names.len() as u64,
                sh_addralign: 1,
                ..Default::default()
            });
        }

        let with_sections = !self.sections.is_empty() || self.section_names;
        let (shoff, e_shnum, e_shstrndx) = if with_sections {
            let shnum = shdrs.len() as u16;
            let (e_shnum, e_shstrndx) = if self.extended {
                shdrs[0].sh_size = u64::from(shnum);
                shdrs[0].sh_link = u32::from(shstrndx);
                (0, SHN_XINDEX)
            } else {
                (shnum, shstrndx)
            };
            let shoff = align_to(&mut file, 8);
            for shdr in &shdrs {
                file.extend_from_slice(as_bytes(shdr));
            }
            (shoff, e_shnum, e_shstrndx)
        } else {
            (0, 0, 0)
        };

        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&ELF_MAGIC);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = ELFDATA2LSB;
        e_ident[6] = EV_CURRENT;

        let header = Elf64Header {
            e_ident,
            e_type: self.e_type,
            e_machine: self.machine,
            e_version: 1,
            e_entry: self.entry,
            e_phoff: if self.segments.is_empty() { 0 } else { ehsize as u64 },
            e_shoff: shoff,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: phentsize as u16,
            e_phnum: self.segments.len() as u16,
            e_shentsize: shentsize as u16,
            e_shnum,
            e_shstrndx,
        };
        file[..ehsize].copy_from_slice(as_bytes(&header));
        for (i, phdr) in phdrs.iter().enumerate() {
            let at = ehsize + i * phentsize;
            file[at..at + phentsize].copy_from_slice(as_bytes(phdr));
        }

        file
    }
}

fn push_name(names: &mut Vec<u8>, name: &str) -> u32 {
    let offset = names.len() as u32;
    names.extend_from_slice(name.as_bytes());
    names.push(0);
    offset
}

fn align_to(file: &mut Vec<u8>, align: usize) -> u64 {
    let padded = file.len().next_multiple_of(align);
    file.resize(padded, 0);
    padded as u64
}

fn append_aligned(file: &mut Vec<u8>, data: &[u8], align: usize) -> u64 {
    let offset = align_to(file, align);
    file.extend_from_slice(data);
    offset
}

fn as_bytes<T: crate::elf::Record>(record: &T) -> &[u8] {
    // SAFETY: `Record` types are padding-free plain data.
    unsafe { core::slice::from_raw_parts(record as *const T as *const u8, size_of::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::read_record;

    #[test]
    fn builds_parseable_image() {
        let elf = ElfBuilder::shared(0x1040)
            .load(0x5, 0x1000, &[0xC3; 8], 8)
            .build();
        let header = Elf64Header::parse(&elf).unwrap();
        assert!(header.is_pie());
        assert_eq!(header.e_phnum, 1);

        let phdr: Elf64ProgramHeader = read_record(&elf, header.e_phoff).unwrap();
        let at = phdr.p_offset as usize;
        assert_eq!(&elf[at..at + 8], &[0xC3; 8]);
    }
}
