//! Image Builder
//!
//! Walks either the program-header table (segment mode) or the
//! section-header table (section mode), reports every entry, and hands each
//! loadable one to the [`RegionMapper`]. Both walks produce the same
//! [`LoadableEntry`] shape, so mapping is identical for the two modes.

use serde::Serialize;

use crate::elf::{
    self, Elf64Header, Elf64ProgramHeader, Elf64SectionHeader, SectionFlags, SegmentFlags,
    SHT_NOBITS, SHT_PROGBITS,
};
use crate::error::LoadError;
use crate::region::{AddressSpace, MapRequest, Permissions, RegionMapper};
use crate::report;
use crate::report::Report;
use crate::strtab::{SectionTable, StringTable};

/// Which header table drives image construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Map `PT_LOAD` program headers.
    #[default]
    Segments,
    /// Map allocated section headers.
    Sections,
}

impl core::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Segments => write!(f, "segments"),
            Self::Sections => write!(f, "sections"),
        }
    }
}

/// Location of the program-header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramTable {
    /// File offset of the first entry
    pub offset: u64,
    /// Stride between entries
    pub entry_size: u64,
    /// Number of entries
    pub count: u64,
}

impl ProgramTable {
    /// Program-header table described by the file header.
    pub fn locate(header: &Elf64Header) -> Self {
        Self {
            offset: header.e_phoff,
            entry_size: u64::from(header.e_phentsize),
            count: u64::from(header.e_phnum),
        }
    }

    /// Read program header `index`.
    pub fn read(&self, buf: &[u8], index: u64) -> Result<Elf64ProgramHeader, LoadError> {
        let offset = index
            .checked_mul(self.entry_size)
            .and_then(|rel| rel.checked_add(self.offset))
            .ok_or(LoadError::Truncated {
                what: "program header",
                offset: self.offset,
                len: self.entry_size,
                file_len: buf.len(),
            })?;
        elf::read_record(buf, offset)
    }
}

/// Header entry a loadable region comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource<'a> {
    /// Program header `index`
    Segment { index: u64 },
    /// Section header `index`, with its resolved name
    Section { index: u64, name: &'a str },
}

impl core::fmt::Display for EntrySource<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Segment { index } => write!(f, "segment {index}"),
            Self::Section { name, .. } => write!(f, "{name}"),
        }
    }
}

/// A header entry that qualifies for mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadableEntry<'a> {
    /// Where the entry came from
    pub source: EntrySource<'a>,
    /// Link-time virtual address
    pub vaddr: u64,
    /// File offset of the contents
    pub file_offset: u64,
    /// Bytes taken from the file
    pub file_size: u64,
    /// Bytes occupied in memory
    pub mem_size: u64,
    /// Final protection
    pub perms: Permissions,
}

impl<'a> LoadableEntry<'a> {
    /// Loadable entry for a `PT_LOAD` program header, `None` otherwise.
    pub fn from_segment(index: u64, phdr: &Elf64ProgramHeader) -> Option<Self> {
        if !phdr.is_load() {
            return None;
        }

        Some(Self {
            source: EntrySource::Segment { index },
            vaddr: phdr.p_vaddr,
            file_offset: phdr.p_offset,
            file_size: phdr.p_filesz,
            mem_size: phdr.p_memsz,
            perms: segment_permissions(phdr.flags()),
        })
    }

    /// Loadable entry for an allocated section, `None` otherwise.
    ///
    /// `SHT_NOBITS` sections take no bytes from the file.
    pub fn from_section(index: u64, shdr: &Elf64SectionHeader, name: &'a str) -> Option<Self> {
        let flags = shdr.flags();
        if !flags.contains(SectionFlags::ALLOC) {
            return None;
        }

        let file_size = match shdr.sh_type {
            SHT_PROGBITS => shdr.sh_size,
            SHT_NOBITS => 0,
            _ => return None,
        };

        Some(Self {
            source: EntrySource::Section { index, name },
            vaddr: shdr.sh_addr,
            file_offset: shdr.sh_offset,
            file_size,
            mem_size: shdr.sh_size,
            perms: section_permissions(flags),
        })
    }
}

/// Map segment flags onto region permissions.
pub fn segment_permissions(flags: SegmentFlags) -> Permissions {
    let mut perms = Permissions::empty();
    perms.set(Permissions::READ, flags.contains(SegmentFlags::R));
    perms.set(Permissions::WRITE, flags.contains(SegmentFlags::W));
    perms.set(Permissions::EXEC, flags.contains(SegmentFlags::X));
    perms
}

/// Map section flags onto region permissions.
///
/// Allocated sections are readable.
pub fn section_permissions(flags: SectionFlags) -> Permissions {
    let mut perms = Permissions::empty();
    perms.set(Permissions::READ, flags.contains(SectionFlags::ALLOC));
    perms.set(Permissions::WRITE, flags.contains(SectionFlags::WRITE));
    perms.set(Permissions::EXEC, flags.contains(SectionFlags::EXECINSTR));
    perms
}

/// A region created in the address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedRegion {
    /// Page-aligned start
    pub start: u64,
    /// Length in bytes
    pub len: u64,
    /// Final protection
    pub perms: Permissions,
    /// Segment index or section name
    pub source: String,
}

/// Builds the image for one load.
pub struct ImageBuilder<'a, 'r, A: ?Sized, R: ?Sized> {
    file: &'a [u8],
    names: StringTable<'a>,
    mapper: RegionMapper,
    space: &'r mut A,
    report: &'r mut R,
    dry_run: bool,
    mapped: Vec<MappedRegion>,
}

impl<'a, 'r, A, R> ImageBuilder<'a, 'r, A, R>
where
    A: AddressSpace + ?Sized,
    R: Report + ?Sized,
{
    /// New builder over `file`.
    pub fn new(
        file: &'a [u8],
        names: StringTable<'a>,
        mapper: RegionMapper,
        space: &'r mut A,
        report: &'r mut R,
        dry_run: bool,
    ) -> Self {
        Self {
            file,
            names,
            mapper,
            space,
            report,
            dry_run,
            mapped: Vec::new(),
        }
    }

    /// Map every loadable program header, in table order.
    pub fn load_segments(mut self, table: &ProgramTable) -> Result<Vec<MappedRegion>, LoadError> {
        for index in 0..table.count {
            let phdr = table.read(self.file, index)?;
            report!(
                self.report,
                "segment {index}: type={} ({:#x}) flags={:#x} offset={:#x} vaddr={:#x} paddr={:#x} filesz={:#x} memsz={:#x} align={:#x}",
                elf::segment_type_name(phdr.p_type),
                phdr.p_type,
                phdr.p_flags,
                phdr.p_offset,
                phdr.p_vaddr,
                phdr.p_paddr,
                phdr.p_filesz,
                phdr.p_memsz,
                phdr.p_align
            );

            let Some(entry) = LoadableEntry::from_segment(index, &phdr) else {
                continue;
            };
            if entry.mem_size < entry.file_size {
                return Err(LoadError::SegmentSizeMismatch {
                    index: index as usize,
                    filesz: entry.file_size,
                    memsz: entry.mem_size,
                });
            }
            self.load_entry(&entry)?;
        }
        Ok(self.mapped)
    }

    /// Map every allocated section, in table order.
    pub fn load_sections(mut self, table: &SectionTable) -> Result<Vec<MappedRegion>, LoadError> {
        for index in 0..table.count {
            let shdr = table.read(self.file, index)?;
            let name = self.names.resolve(shdr.sh_name);
            report!(
                self.report,
                "section {index}: name={name} type={} ({:#x}) flags={:#x} addr={:#x} offset={:#x} size={:#x} link={} info={} addralign={:#x} entsize={:#x}",
                elf::section_type_name(shdr.sh_type),
                shdr.sh_type,
                shdr.sh_flags,
                shdr.sh_addr,
                shdr.sh_offset,
                shdr.sh_size,
                shdr.sh_link,
                shdr.sh_info,
                shdr.sh_addralign,
                shdr.sh_entsize
            );

            if let Some(entry) = LoadableEntry::from_section(index, &shdr, name) {
                self.load_entry(&entry)?;
            }
        }
        Ok(self.mapped)
    }

    fn load_entry(&mut self, entry: &LoadableEntry<'_>) -> Result<(), LoadError> {
        let label = entry.source.to_string();
        report!(
            self.report,
            "loading {label}: file {:#x}+{:#x} -> {:#x} size {:#x} perm {}",
            entry.file_offset,
            entry.file_size,
            entry.vaddr.wrapping_add(self.mapper.base()),
            entry.mem_size,
            entry.perms
        );

        if entry.mem_size == 0 {
            report!(self.report, "skipping {label}: zero size");
            return Ok(());
        }

        // NOBITS entries may carry any offset; nothing is read for them.
        let file_bytes = if entry.file_size == 0 {
            &[][..]
        } else {
            elf::file_extent(self.file, entry.file_offset, entry.file_size).ok_or_else(|| {
                LoadError::ExtentOutOfBounds {
                    label: label.clone(),
                    offset: entry.file_offset,
                    len: entry.file_size,
                    file_len: self.file.len(),
                }
            })?
        };

        if self.dry_run {
            // Same arithmetic as a real load, minus the address space.
            self.mapper.plan(&label, entry.vaddr, entry.mem_size)?;
            return Ok(());
        }

        let request = MapRequest {
            vaddr: entry.vaddr,
            file_bytes,
            mem_size: entry.mem_size,
            perms: entry.perms,
        };
        if let Some(region) = self.mapper.map(&mut *self.space, &label, &request)? {
            report!(
                self.report,
                "mapped {label}: [{:#x}, {:#x}) {}",
                region.start,
                region.end(),
                entry.perms
            );
            self.mapped.push(MappedRegion {
                start: region.start,
                len: region.len,
                perms: entry.perms,
                source: label,
            });
        }
        Ok(())
    }
}
