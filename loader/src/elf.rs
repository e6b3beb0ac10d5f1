//! ELF64 record shapes and the raw structure reader.
//!
//! The three on-disk records (file header, program header, section header)
//! are plain `repr(C)` structs whose fields are all naturally aligned, so
//! the in-memory layout matches the ELF64 byte layout exactly. Records are
//! copied out of the file buffer with an unaligned read; the buffer itself
//! carries no alignment guarantee.

use core::mem::size_of;

use crate::error::LoadError;

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Index of the class byte in `e_ident`
pub const EI_CLASS: usize = 4;
/// Index of the data encoding byte in `e_ident`
pub const EI_DATA: usize = 5;
/// Index of the version byte in `e_ident`
pub const EI_VERSION: usize = 6;
/// Index of the OS/ABI byte in `e_ident`
pub const EI_OSABI: usize = 7;

/// ELF class: 32-bit
pub const ELFCLASS32: u8 = 1;
/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;
/// ELF data encoding: big endian
pub const ELFDATA2MSB: u8 = 2;

/// Current ELF version
pub const EV_CURRENT: u8 = 1;

/// Machine type: x86_64
pub const EM_X86_64: u16 = 62;
/// Machine type: AArch64
pub const EM_AARCH64: u16 = 183;
/// Machine type: RISC-V
pub const EM_RISCV: u16 = 243;

/// Undefined section index
pub const SHN_UNDEF: u16 = 0;
/// Section index is held in section 0's `sh_link`
pub const SHN_XINDEX: u16 = 0xFFFF;

/// Program header type: unused entry
pub const PT_NULL: u32 = 0;
/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;
/// Program header type: dynamic linking info
pub const PT_DYNAMIC: u32 = 2;
/// Program header type: interpreter path
pub const PT_INTERP: u32 = 3;
/// Program header type: auxiliary information
pub const PT_NOTE: u32 = 4;
/// Program header type: reserved
pub const PT_SHLIB: u32 = 5;
/// Program header type: program header table
pub const PT_PHDR: u32 = 6;
/// Program header type: thread-local storage template
pub const PT_TLS: u32 = 7;

/// Section type: inactive
pub const SHT_NULL: u32 = 0;
/// Section type: program-defined contents
pub const SHT_PROGBITS: u32 = 1;
/// Section type: symbol table
pub const SHT_SYMTAB: u32 = 2;
/// Section type: string table
pub const SHT_STRTAB: u32 = 3;
/// Section type: relocations with addends
pub const SHT_RELA: u32 = 4;
/// Section type: symbol hash table
pub const SHT_HASH: u32 = 5;
/// Section type: dynamic linking info
pub const SHT_DYNAMIC: u32 = 6;
/// Section type: notes
pub const SHT_NOTE: u32 = 7;
/// Section type: occupies memory but no file space
pub const SHT_NOBITS: u32 = 8;
/// Section type: relocations without addends
pub const SHT_REL: u32 = 9;
/// Section type: dynamic symbol table
pub const SHT_DYNSYM: u32 = 11;

bitflags::bitflags! {
    /// Program header `p_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Executable.
        const X = 0x1;
        /// Writable.
        const W = 0x2;
        /// Readable.
        const R = 0x4;
        /// OS-specific bits.
        const MASKOS = 0x0FF0_0000;
        /// Processor-specific bits.
        const MASKPROC = 0xF000_0000;
    }
}

bitflags::bitflags! {
    /// Section header `sh_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        /// Writable at runtime.
        const WRITE = 0x1;
        /// Occupies memory at runtime.
        const ALLOC = 0x2;
        /// Holds executable instructions.
        const EXECINSTR = 0x4;
        /// Might be merged.
        const MERGE = 0x10;
        /// Holds NUL-terminated strings.
        const STRINGS = 0x20;
        /// `sh_info` holds a section index.
        const INFO_LINK = 0x40;
        /// Preserve order after combining.
        const LINK_ORDER = 0x80;
        /// Non-standard OS handling required.
        const OS_NONCONFORMING = 0x100;
        /// Member of a section group.
        const GROUP = 0x200;
        /// Holds thread-local data.
        const TLS = 0x400;
        /// OS-specific bits.
        const MASKOS = 0x0FF0_0000;
        /// Processor-specific bits.
        const MASKPROC = 0xF000_0000;
    }
}

/// Object file type (`e_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// No file type
    None,
    /// Relocatable file
    Relocatable,
    /// Executable file
    Executable,
    /// Shared object (also position-independent executables)
    Shared,
    /// Core file
    Core,
    /// OS- or processor-specific type
    Other(u16),
}

impl From<u16> for ObjectType {
    fn from(raw: u16) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Relocatable,
            2 => Self::Executable,
            3 => Self::Shared,
            4 => Self::Core,
            other => Self::Other(other),
        }
    }
}

impl core::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Relocatable => write!(f, "REL"),
            Self::Executable => write!(f, "EXEC"),
            Self::Shared => write!(f, "DYN"),
            Self::Core => write!(f, "CORE"),
            Self::Other(raw) => write!(f, "{raw:#06x}"),
        }
    }
}

/// Short name for a machine type.
pub fn machine_name(machine: u16) -> &'static str {
    match machine {
        EM_X86_64 => "x86-64",
        EM_AARCH64 => "AArch64",
        EM_RISCV => "RISC-V",
        _ => "unknown",
    }
}

/// Machine type of the host this loader runs on, if known.
pub fn host_machine() -> Option<u16> {
    if cfg!(target_arch = "x86_64") {
        Some(EM_X86_64)
    } else if cfg!(target_arch = "aarch64") {
        Some(EM_AARCH64)
    } else if cfg!(target_arch = "riscv64") {
        Some(EM_RISCV)
    } else {
        None
    }
}

/// Short name for a program header type.
pub fn segment_type_name(p_type: u32) -> &'static str {
    match p_type {
        PT_NULL => "NULL",
        PT_LOAD => "LOAD",
        PT_DYNAMIC => "DYNAMIC",
        PT_INTERP => "INTERP",
        PT_NOTE => "NOTE",
        PT_SHLIB => "SHLIB",
        PT_PHDR => "PHDR",
        PT_TLS => "TLS",
        0x6000_0000..=0x6FFF_FFFF => "OS",
        0x7000_0000..=0x7FFF_FFFF => "PROC",
        _ => "UNKNOWN",
    }
}

/// Short name for a section header type.
pub fn section_type_name(sh_type: u32) -> &'static str {
    match sh_type {
        SHT_NULL => "NULL",
        SHT_PROGBITS => "PROGBITS",
        SHT_SYMTAB => "SYMTAB",
        SHT_STRTAB => "STRTAB",
        SHT_RELA => "RELA",
        SHT_HASH => "HASH",
        SHT_DYNAMIC => "DYNAMIC",
        SHT_NOTE => "NOTE",
        SHT_NOBITS => "NOBITS",
        SHT_REL => "REL",
        SHT_DYNSYM => "DYNSYM",
        _ => "OTHER",
    }
}

/// ELF64 file header
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Elf64Header {
    /// Magic number and other info
    pub e_ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Machine type
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section name string table index
    pub e_shstrndx: u16,
}

/// ELF64 program header
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Elf64ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment file offset
    pub p_offset: u64,
    /// Segment virtual address
    pub p_vaddr: u64,
    /// Segment physical address (unused)
    pub p_paddr: u64,
    /// Segment size in file
    pub p_filesz: u64,
    /// Segment size in memory
    pub p_memsz: u64,
    /// Segment alignment
    pub p_align: u64,
}

/// ELF64 section header
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Elf64SectionHeader {
    /// Section name (string table index)
    pub sh_name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub sh_flags: u64,
    /// Section virtual address
    pub sh_addr: u64,
    /// Section file offset
    pub sh_offset: u64,
    /// Section size
    pub sh_size: u64,
    /// Link to another section
    pub sh_link: u32,
    /// Additional section information
    pub sh_info: u32,
    /// Section alignment
    pub sh_addralign: u64,
    /// Entry size if section holds table
    pub sh_entsize: u64,
}

const _: () = assert!(size_of::<Elf64Header>() == 64);
const _: () = assert!(size_of::<Elf64ProgramHeader>() == 56);
const _: () = assert!(size_of::<Elf64SectionHeader>() == 64);

/// A fixed-layout record that can be copied out of a byte buffer.
///
/// # Safety
///
/// Implementors must be `repr(C)` plain-old-data: every bit pattern of
/// `size_of::<Self>()` bytes is a valid value and there is no padding.
pub unsafe trait Record: Copy {
    /// Human-readable name used in error messages.
    const WHAT: &'static str;
}

// SAFETY: all three are repr(C) with only integer fields and no padding
// (sizes asserted above).
unsafe impl Record for Elf64Header {
    const WHAT: &'static str = "ELF header";
}
unsafe impl Record for Elf64ProgramHeader {
    const WHAT: &'static str = "program header";
}
unsafe impl Record for Elf64SectionHeader {
    const WHAT: &'static str = "section header";
}

/// Copy a record of type `T` out of `buf` at `offset`.
///
/// The source need not be aligned. Fails with [`LoadError::Truncated`] when
/// the record would extend past the end of the buffer.
pub fn read_record<T: Record>(buf: &[u8], offset: u64) -> Result<T, LoadError> {
    let len = size_of::<T>();
    let bytes = usize::try_from(offset)
        .ok()
        .and_then(|start| buf.get(start..start.checked_add(len)?))
        .ok_or(LoadError::Truncated {
            what: T::WHAT,
            offset,
            len: len as u64,
            file_len: buf.len(),
        })?;

    // SAFETY: `bytes` holds exactly size_of::<T>() initialized bytes and
    // `T: Record` accepts any bit pattern.
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// Borrow `len` bytes of `buf` starting at `offset`, if they are in range.
pub fn file_extent(buf: &[u8], offset: u64, len: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let len = usize::try_from(len).ok()?;
    buf.get(start..start.checked_add(len)?)
}

impl Elf64Header {
    /// Read and validate the file header.
    ///
    /// The magic bytes are checked before anything else is read, then the
    /// class byte. Other fields are not validated here.
    pub fn parse(buf: &[u8]) -> Result<Self, LoadError> {
        if buf.get(..ELF_MAGIC.len()) != Some(&ELF_MAGIC[..]) {
            return Err(LoadError::BadMagic {
                found: buf.iter().take(ELF_MAGIC.len()).copied().collect(),
            });
        }

        let class = buf.get(EI_CLASS).copied().unwrap_or(0);
        if class != ELFCLASS64 {
            return Err(LoadError::UnsupportedClass { class });
        }

        read_record(buf, 0)
    }

    /// Object file type
    pub fn object_type(&self) -> ObjectType {
        ObjectType::from(self.e_type)
    }

    /// Position-independent inputs are shared objects.
    pub fn is_pie(&self) -> bool {
        self.object_type() == ObjectType::Shared
    }
}

impl Elf64ProgramHeader {
    /// Segment flags, keeping reserved bits as-is
    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_retain(self.p_flags)
    }

    /// Check if this is a loadable segment
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

impl Elf64SectionHeader {
    /// Section flags, keeping reserved bits as-is
    pub fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_retain(self.sh_flags)
    }
}
