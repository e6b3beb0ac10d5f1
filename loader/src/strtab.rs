//! Section-name string table resolution.
//!
//! A [`StringTable`] is a borrowed window of the file buffer. Lookups never
//! fail: an offset outside the table (or a table that is absent altogether)
//! resolves to [`NAME_PLACEHOLDER`].

use crate::config::NAME_PLACEHOLDER;
use crate::elf::{self, Elf64Header, Elf64SectionHeader, SHN_UNDEF, SHN_XINDEX};
use crate::error::LoadError;

/// Borrowed string table.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringTable<'a> {
    bytes: Option<&'a [u8]>,
}

impl<'a> StringTable<'a> {
    /// Resolver with no backing table; every lookup yields the placeholder.
    pub fn absent() -> Self {
        Self { bytes: None }
    }

    /// Wrap a raw table.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes: Some(bytes) }
    }

    /// Whether a backing table is present.
    pub fn is_present(&self) -> bool {
        self.bytes.is_some()
    }

    /// Table size in bytes (0 when absent).
    pub fn size(&self) -> usize {
        self.bytes.map_or(0, <[u8]>::len)
    }

    /// Resolve the NUL-terminated string at `offset`.
    ///
    /// A string that runs to the end of the table without a terminator is
    /// cut at the table boundary. Non UTF-8 names resolve to the placeholder.
    pub fn resolve(&self, offset: u32) -> &'a str {
        let Some(bytes) = self.bytes else {
            return NAME_PLACEHOLDER;
        };
        let Some(tail) = bytes.get(offset as usize..) else {
            return NAME_PLACEHOLDER;
        };
        if tail.is_empty() {
            return NAME_PLACEHOLDER;
        }

        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        core::str::from_utf8(&tail[..end]).unwrap_or(NAME_PLACEHOLDER)
    }

    /// Iterate over every string in the table, in order.
    pub fn names(&self) -> impl Iterator<Item = &'a str> + 'a {
        let bytes = self.bytes.unwrap_or(&[]);
        let trimmed = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        let empty = bytes.is_empty();

        trimmed
            .split(|&b| b == 0)
            .filter(move |_| !empty)
            .map(|name| core::str::from_utf8(name).unwrap_or(NAME_PLACEHOLDER))
    }
}

/// Location of the section-header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionTable {
    /// File offset of the first entry
    pub offset: u64,
    /// Stride between entries
    pub entry_size: u64,
    /// Number of entries
    pub count: u64,
    /// Index of the section-name string table, if any
    pub name_index: Option<u64>,
}

impl SectionTable {
    /// Locate the section-header table, applying extended numbering.
    ///
    /// When `e_shnum` is zero the real count lives in section 0's `sh_size`;
    /// when `e_shstrndx` is `SHN_XINDEX` the real index lives in section 0's
    /// `sh_link`. If section 0 cannot be read the table is treated as empty.
    pub fn locate(buf: &[u8], header: &Elf64Header) -> Self {
        let offset = header.e_shoff;
        let entry_size = u64::from(header.e_shentsize);
        let mut count = u64::from(header.e_shnum);
        let mut name_index = u64::from(header.e_shstrndx);

        let needs_first = offset != 0
            && ((count == 0) || header.e_shstrndx == SHN_XINDEX);
        if needs_first {
            match elf::read_record::<Elf64SectionHeader>(buf, offset) {
                Ok(first) => {
                    if count == 0 {
                        count = first.sh_size;
                        log::debug!("extended section count: {count}");
                    }
                    if header.e_shstrndx == SHN_XINDEX {
                        name_index = u64::from(first.sh_link);
                        log::debug!("extended section-name index: {name_index}");
                    }
                }
                Err(e) => {
                    log::warn!("section header 0 unreadable, ignoring section table: {e}");
                    count = 0;
                    name_index = u64::from(SHN_UNDEF);
                }
            }
        }

        let name_index = (name_index != u64::from(SHN_UNDEF)).then_some(name_index);

        Self {
            offset,
            entry_size,
            count,
            name_index,
        }
    }

    /// File offset of entry `index`.
    pub fn entry_offset(&self, index: u64) -> Option<u64> {
        index
            .checked_mul(self.entry_size)
            .and_then(|rel| rel.checked_add(self.offset))
    }

    /// Read section header `index`.
    pub fn read(&self, buf: &[u8], index: u64) -> Result<Elf64SectionHeader, LoadError> {
        let offset = self.entry_offset(index).ok_or(LoadError::Truncated {
            what: "section header",
            offset: self.offset,
            len: self.entry_size,
            file_len: buf.len(),
        })?;
        elf::read_record(buf, offset)
    }

    /// Capture the section-name string table.
    ///
    /// Any problem (no index, index out of range, table outside the file)
    /// degrades to an absent table.
    pub fn names<'a>(&self, buf: &'a [u8]) -> StringTable<'a> {
        let Some(index) = self.name_index else {
            log::debug!("no section-name table");
            return StringTable::absent();
        };

        if index >= self.count {
            log::warn!(
                "section-name index {index} out of range ({} sections)",
                self.count
            );
            return StringTable::absent();
        }

        let shdr = match self.read(buf, index) {
            Ok(shdr) => shdr,
            Err(e) => {
                log::warn!("section-name table header unreadable: {e}");
                return StringTable::absent();
            }
        };

        match elf::file_extent(buf, shdr.sh_offset, shdr.sh_size) {
            Some(bytes) => StringTable::new(bytes),
            None => {
                log::warn!(
                    "section-name table {:#x}+{:#x} lies outside the file",
                    shdr.sh_offset,
                    shdr.sh_size
                );
                StringTable::absent()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::ElfBuilder;

    #[test]
    fn test_resolve_names() {
        let table = StringTable::new(b"\0.text\0.data\0");
        assert_eq!(table.resolve(1), ".text");
        assert_eq!(table.resolve(7), ".data");
        assert_eq!(table.resolve(3), "ext");
        assert_eq!(table.resolve(0), "");
    }

    #[test]
    fn test_out_of_range_is_placeholder() {
        let table = StringTable::new(b"\0.text\0");
        assert_eq!(table.resolve(7), NAME_PLACEHOLDER);
        assert_eq!(table.resolve(u32::MAX), NAME_PLACEHOLDER);
    }

    #[test]
    fn test_absent_table_is_placeholder() {
        let table = StringTable::absent();
        assert!(!table.is_present());
        assert_eq!(table.resolve(0), NAME_PLACEHOLDER);
        assert_eq!(table.names().count(), 0);
    }

    #[test]
    fn test_unterminated_name_stops_at_table_end() {
        let table = StringTable::new(b"\0.bss");
        assert_eq!(table.resolve(1), ".bss");
    }

    #[test]
    fn test_names_lists_every_string() {
        let table = StringTable::new(b"\0.text\0.shstrtab\0");
        let names: Vec<_> = table.names().collect();
        assert_eq!(names, ["", ".text", ".shstrtab"]);
    }

    #[test]
    fn test_locate_without_name_table() {
        let elf = ElfBuilder::executable(0x401000)
            .section(".text", crate::elf::SHT_PROGBITS, 0x6, 0x401000, &[0x90; 16])
            .without_section_names()
            .build();
        let header = Elf64Header::parse(&elf).unwrap();
        let table = SectionTable::locate(&elf, &header);
        assert_eq!(table.name_index, None);
        assert!(!table.names(&elf).is_present());
    }

    #[test]
    fn test_locate_with_name_table() {
        let elf = ElfBuilder::executable(0x401000)
            .section(".text", crate::elf::SHT_PROGBITS, 0x6, 0x401000, &[0x90; 16])
            .build();
        let header = Elf64Header::parse(&elf).unwrap();
        let table = SectionTable::locate(&elf, &header);
        let names = table.names(&elf);
        let text = table.read(&elf, 1).unwrap();
        assert_eq!(names.resolve(text.sh_name), ".text");
    }

    #[test]
    fn test_extended_numbering() {
        let elf = ElfBuilder::executable(0x401000)
            .section(".text", crate::elf::SHT_PROGBITS, 0x6, 0x401000, &[0x90; 16])
            .extended_numbering()
            .build();
        let header = Elf64Header::parse(&elf).unwrap();
        assert_eq!(header.e_shnum, 0);
        assert_eq!(header.e_shstrndx, SHN_XINDEX);

        let table = SectionTable::locate(&elf, &header);
        assert_eq!(table.count, 3);
        assert_eq!(table.name_index, Some(2));
        assert_eq!(table.names(&elf).resolve(1), ".text");
    }

    #[test]
    fn test_unreadable_extended_count_degrades_to_empty() {
        let mut elf = ElfBuilder::executable(0x401000)
            .section(".text", crate::elf::SHT_PROGBITS, 0x6, 0x401000, &[0x90; 16])
            .build();
        // e_shoff at 40, e_shnum at 60
        elf[40..48].copy_from_slice(&0xFFFF_FFFFu64.to_le_bytes());
        elf[60..62].copy_from_slice(&0u16.to_le_bytes());
        let header = Elf64Header::parse(&elf).unwrap();

        let table = SectionTable::locate(&elf, &header);
        assert_eq!(table.count, 0);
        assert_eq!(table.name_index, None);
        assert!(!table.names(&elf).is_present());
    }

    #[test]
    fn test_name_index_out_of_range_degrades() {
        let mut elf = ElfBuilder::executable(0x401000)
            .section(".text", crate::elf::SHT_PROGBITS, 0x6, 0x401000, &[0x90; 16])
            .build();
        // e_shstrndx lives at offset 62
        elf[62..64].copy_from_slice(&40u16.to_le_bytes());
        let header = Elf64Header::parse(&elf).unwrap();
        let table = SectionTable::locate(&elf, &header);
        assert!(!table.names(&elf).is_present());
    }
}
