//! Loader Driver
//!
//! Runs one load through its states:
//!
//! ```text
//! Start -> HeaderValidated -> TablesParsed -> StringsResolved -> ImageBuilt
//!                                                                  |
//!                                            Transferred <---------+--------> DryRunComplete
//! ```
//!
//! Any failure moves the driver to `Aborted`. Nothing is rolled back:
//! regions mapped before the failure stay mapped, and the caller is
//! expected to exit.

use serde::Serialize;

use crate::config::{DEFAULT_PIE_BASE, PAGE_SIZE};
use crate::elf::{self, Elf64Header, ObjectType, ELFDATA2LSB, EI_DATA, EI_OSABI, EI_VERSION, EV_CURRENT};
use crate::error::LoadError;
use crate::image::{ImageBuilder, LoadMode, MappedRegion, ProgramTable};
use crate::region::{AddressSpace, RegionMapper};
use crate::report;
use crate::report::Report;
use crate::strtab::SectionTable;

/// Options for one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Header table that drives mapping
    pub mode: LoadMode,
    /// Parse and report, but create no regions and never transfer
    pub dry_run: bool,
    /// Offset added to every address; PIE inputs get
    /// [`DEFAULT_PIE_BASE`] when this is `None`
    pub base: Option<u64>,
    /// Alignment granule (power of two)
    pub page_size: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            mode: LoadMode::Segments,
            dry_run: false,
            base: None,
            page_size: PAGE_SIZE,
        }
    }
}

/// Driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadState {
    Start,
    HeaderValidated,
    TablesParsed,
    StringsResolved,
    ImageBuilt,
    Transferred,
    DryRunComplete,
    Aborted,
}

impl LoadState {
    /// No further transitions leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Transferred | Self::DryRunComplete | Self::Aborted)
    }
}

/// Address control is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint(u64);

impl EntryPoint {
    /// Runtime address (entry plus base offset).
    pub fn address(self) -> u64 {
        self.0
    }

    /// Jump to the entry point. Never returns.
    ///
    /// # Safety
    ///
    /// The address must point at executable code mapped by a completed,
    /// non-dry-run load. Whatever runs there takes over the process.
    pub unsafe fn transfer(self) -> ! {
        let entry: extern "C" fn() -> ! = unsafe { core::mem::transmute(self.0 as usize) };
        entry()
    }
}

/// How a successful load ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Dry run: nothing mapped, nothing to run.
    DryRun,
    /// Image built; control may be transferred.
    Transfer(EntryPoint),
}

/// Summary of a successful load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    /// `e_type`
    pub object_type: ObjectType,
    /// `e_machine`
    pub machine: u16,
    /// Link-time entry address
    pub entry: u64,
    /// Base offset applied to every address
    pub base: u64,
    /// Entry address after applying the base
    pub entry_address: u64,
    /// Table that drove mapping
    pub mode: LoadMode,
    /// Whether mapping was skipped
    pub dry_run: bool,
    /// Regions created, in table order
    pub regions: Vec<MappedRegion>,
    /// Final driver state
    pub state: LoadState,
}

/// Result of [`Loader::load`].
#[derive(Debug)]
pub struct Loaded {
    /// What was done
    pub summary: LoadSummary,
    /// What to do next
    pub completion: Completion,
}

/// One load of one file.
pub struct Loader<'a, A, R> {
    file: &'a [u8],
    options: LoaderOptions,
    space: A,
    report: R,
    state: LoadState,
}

impl<'a, A: AddressSpace, R: Report> Loader<'a, A, R> {
    /// Loader for `file`, mapping into `space` and narrating into `report`.
    pub fn new(file: &'a [u8], options: LoaderOptions, space: A, report: R) -> Self {
        Self {
            file,
            options,
            space,
            report,
            state: LoadState::Start,
        }
    }

    /// Current state.
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Address space the image is built in.
    pub fn space(&self) -> &A {
        &self.space
    }

    /// Report sink.
    pub fn report(&self) -> &R {
        &self.report
    }

    /// Mutable access to the report sink.
    pub fn report_mut(&mut self) -> &mut R {
        &mut self.report
    }

    /// Release the address space and report sink.
    pub fn into_parts(self) -> (A, R) {
        (self.space, self.report)
    }

    fn advance(&mut self, next: LoadState) {
        log::debug!("load state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the load up to `ImageBuilt` (then `DryRunComplete` for dry runs).
    ///
    /// On failure the driver is left `Aborted`.
    pub fn load(&mut self) -> Result<Loaded, LoadError> {
        debug_assert_eq!(self.state, LoadState::Start, "a Loader runs once");

        match self.run() {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                log::error!("load aborted in state {:?}: {e}", self.state);
                self.advance(LoadState::Aborted);
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<Loaded, LoadError> {
        let file = self.file;

        // Start -> HeaderValidated
        let header = Elf64Header::parse(file)?;
        self.advance(LoadState::HeaderValidated);
        self.report_header(&header);

        // HeaderValidated -> TablesParsed
        let programs = ProgramTable::locate(&header);
        let sections = SectionTable::locate(file, &header);
        let base = match (self.options.base, header.is_pie()) {
            (Some(base), _) => base,
            (None, true) => DEFAULT_PIE_BASE,
            (None, false) => 0,
        };
        let entry_address = header
            .e_entry
            .checked_add(base)
            .ok_or_else(|| LoadError::AddressOverflow {
                label: "entry point".to_string(),
                addr: header.e_entry,
                len: base,
            })?;
        report!(&mut self.report, "Found {} program headers at {:#x}", programs.count, programs.offset);
        report!(&mut self.report, "Found {} sections at {:#x}", sections.count, sections.offset);
        report!(&mut self.report, "Base offset: {base:#x}");
        self.advance(LoadState::TablesParsed);

        // TablesParsed -> StringsResolved
        let names = sections.names(file);
        if names.is_present() {
            report!(&mut self.report, "strtab:");
            for name in names.names() {
                report!(&mut self.report, "\t{name}");
            }
        }
        self.advance(LoadState::StringsResolved);

        // StringsResolved -> ImageBuilt
        let mapper = RegionMapper::new(base, self.options.page_size);
        let builder = ImageBuilder::new(
            file,
            names,
            mapper,
            &mut self.space,
            &mut self.report,
            self.options.dry_run,
        );
        let regions = match self.options.mode {
            LoadMode::Segments => builder.load_segments(&programs)?,
            LoadMode::Sections => builder.load_sections(&sections)?,
        };
        self.advance(LoadState::ImageBuilt);

        let completion = if self.options.dry_run {
            report!(&mut self.report, "Dry run complete; entry would be {entry_address:#x}");
            self.advance(LoadState::DryRunComplete);
            Completion::DryRun
        } else {
            report!(&mut self.report, "Program loaded. Entry at {entry_address:#x}");
            Completion::Transfer(EntryPoint(entry_address))
        };

        Ok(Loaded {
            summary: LoadSummary {
                object_type: header.object_type(),
                machine: header.e_machine,
                entry: header.e_entry,
                base,
                entry_address,
                mode: self.options.mode,
                dry_run: self.options.dry_run,
                regions,
                state: self.state,
            },
            completion,
        })
    }

    fn report_header(&mut self, header: &Elf64Header) {
        let ident = header.e_ident;
        if ident[EI_DATA] != ELFDATA2LSB {
            log::warn!("data encoding {} is not little-endian; fields are read as-is", ident[EI_DATA]);
        }
        if ident[EI_VERSION] != EV_CURRENT {
            log::warn!("unexpected ELF version {}", ident[EI_VERSION]);
        }
        if elf::host_machine().is_some_and(|host| host != header.e_machine) {
            log::warn!(
                "machine {} ({}) does not match the host",
                header.e_machine,
                elf::machine_name(header.e_machine)
            );
        }

        report!(
            &mut self.report,
            "ELF64 {} for {} ({}), OS/ABI {}",
            header.object_type(),
            elf::machine_name(header.e_machine),
            header.e_machine,
            ident[EI_OSABI]
        );
        if header.is_pie() {
            report!(&mut self.report, "Binary is PIE");
        }
        report!(&mut self.report, "Program entry: {:#x}", header.e_entry);
    }

    /// Take the one-way transition into the loaded program.
    ///
    /// # Safety
    ///
    /// `entry` must come from a non-dry-run [`Completion::Transfer`] of this
    /// loader, and the mapped image must be a program that can run in this
    /// process with no arguments, environment or auxiliary vector.
    pub unsafe fn transfer(mut self, entry: EntryPoint) -> ! {
        debug_assert_eq!(self.state, LoadState::ImageBuilt);
        report!(&mut self.report, "Jumping to entry {:#x}", entry.address());
        self.advance(LoadState::Transferred);
        unsafe { entry.transfer() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{EI_CLASS, ELFCLASS32};
    use crate::fixture::ElfBuilder;
    use crate::region::{Permissions, Region, SimulatedAddressSpace};

    type TestLoader<'a> = Loader<'a, SimulatedAddressSpace, Vec<String>>;

    fn loader(elf: &[u8], options: LoaderOptions) -> TestLoader<'_> {
        Loader::new(elf, options, SimulatedAddressSpace::default(), Vec::new())
    }

    #[test]
    fn test_static_executable_end_to_end() {
        let elf = ElfBuilder::executable(0x400080)
            .load(0x5, 0x400000, &[0xC3; 4096], 4096)
            .build();
        let mut loader = loader(&elf, LoaderOptions::default());

        let loaded = loader.load().unwrap();
        assert_eq!(loader.state(), LoadState::ImageBuilt);
        assert_eq!(loaded.completion, Completion::Transfer(EntryPoint(0x400080)));
        assert_eq!(loaded.summary.regions.len(), 1);

        let region = &loaded.summary.regions[0];
        assert_eq!((region.start, region.len), (0x400000, 4096));
        assert_eq!(region.perms, Permissions::READ | Permissions::EXEC);
        assert_eq!(loader.space().reservations(), &[Region { start: 0x400000, len: 4096 }]);
    }

    #[test]
    fn test_pie_gets_default_base() {
        let elf = ElfBuilder::shared(0x1040)
            .load(0x5, 0x1000, &[0xC3; 64], 64)
            .load(0x6, 0x3000, &[1; 16], 0x100)
            .build();
        let mut loader = loader(&elf, LoaderOptions::default());

        let loaded = loader.load().unwrap();
        assert_eq!(loaded.summary.base, DEFAULT_PIE_BASE);
        assert_eq!(loaded.summary.entry_address, 0x1040 + DEFAULT_PIE_BASE);
        let starts: Vec<_> = loaded.summary.regions.iter().map(|r| r.start).collect();
        assert_eq!(starts, [DEFAULT_PIE_BASE + 0x1000, DEFAULT_PIE_BASE + 0x3000]);
        assert!(loader.report().iter().any(|l| l == "Binary is PIE"));
    }

    #[test]
    fn test_explicit_base_wins() {
        let elf = ElfBuilder::shared(0x1040)
            .load(0x5, 0x1000, &[0xC3; 64], 64)
            .build();
        let options = LoaderOptions {
            base: Some(0x2000_0000),
            ..Default::default()
        };
        let mut loader = loader(&elf, options);

        let loaded = loader.load().unwrap();
        assert_eq!(loaded.summary.base, 0x2000_0000);
        assert_eq!(loaded.completion, Completion::Transfer(EntryPoint(0x2000_1040)));
    }

    #[test]
    fn test_dry_run_maps_nothing() {
        let elf = ElfBuilder::executable(0x401000)
            .load(0x5, 0x401000, &[0xC3; 64], 64)
            .build();
        let options = LoaderOptions {
            dry_run: true,
            ..Default::default()
        };
        let mut loader = loader(&elf, options);

        let loaded = loader.load().unwrap();
        assert_eq!(loaded.completion, Completion::DryRun);
        assert_eq!(loader.state(), LoadState::DryRunComplete);
        assert!(loaded.summary.regions.is_empty());
        assert_eq!(loader.space().page_count(), 0);
    }

    #[test]
    fn test_bad_magic_aborts() {
        let mut elf = ElfBuilder::executable(0x401000).build();
        elf[1] = b'X';
        let mut loader = loader(&elf, LoaderOptions::default());

        let err = loader.load().unwrap_err();
        assert!(matches!(err, LoadError::BadMagic { .. }));
        assert_eq!(loader.state(), LoadState::Aborted);
        assert!(loader.report().is_empty());
    }

    #[test]
    fn test_32bit_class_aborts() {
        let mut elf = ElfBuilder::executable(0x401000)
            .load(0x5, 0x401000, &[0xC3; 64], 64)
            .build();
        elf[EI_CLASS] = ELFCLASS32;
        let mut loader = loader(&elf, LoaderOptions::default());

        assert!(matches!(loader.load(), Err(LoadError::UnsupportedClass { .. })));
        assert_eq!(loader.space().page_count(), 0);
    }

    #[test]
    fn test_reservation_failure_aborts_without_rollback() {
        let elf = ElfBuilder::executable(0x401000)
            .load(0x5, 0x401000, &[0xC3; 64], 64)
            .load(0x6, 0x601000, &[1; 64], 64)
            .build();
        let mut space = SimulatedAddressSpace::default();
        space.deny(Region { start: 0x601000, len: 0x1000 });
        let mut loader = Loader::new(&elf, LoaderOptions::default(), space, Vec::<String>::new());

        let err = loader.load().unwrap_err();
        assert!(matches!(err, LoadError::Reserve { start: 0x601000, .. }));
        assert_eq!(loader.state(), LoadState::Aborted);
        // The first segment stays mapped.
        assert!(loader.space().page(0x401000).is_some());
    }

    #[test]
    fn test_sections_mode_without_names() {
        let elf = ElfBuilder::executable(0x401000)
            .section(".text", crate::elf::SHT_PROGBITS, 0x6, 0x401000, &[0xC3; 32])
            .without_section_names()
            .build();
        let options = LoaderOptions {
            mode: LoadMode::Sections,
            ..Default::default()
        };
        let mut loader = loader(&elf, options);

        let loaded = loader.load().unwrap();
        assert_eq!(loaded.summary.regions.len(), 1);
        assert_eq!(loaded.summary.regions[0].source, "???");
        assert!(!loader.report().iter().any(|l| l == "strtab:"));
    }

    #[test]
    fn test_strtab_listing_is_reported() {
        let elf = ElfBuilder::executable(0x401000)
            .section(".text", crate::elf::SHT_PROGBITS, 0x6, 0x401000, &[0xC3; 32])
            .build();
        let mut loader = loader(&elf, LoaderOptions { dry_run: true, ..Default::default() });

        loader.load().unwrap();
        let lines = loader.report();
        let at = lines.iter().position(|l| l == "strtab:").unwrap();
        assert_eq!(lines[at + 2], "\t.text");
        assert_eq!(lines[at + 3], "\t.shstrtab");
    }

    #[test]
    fn test_segments_mode_ignores_unreadable_section_table() {
        let mut elf = ElfBuilder::executable(0x401000)
            .load(0x5, 0x401000, &[0xC3; 64], 64)
            .build();
        // e_shoff at 40, e_shnum at 60
        elf[40..48].copy_from_slice(&0xFFFF_FFFFu64.to_le_bytes());
        elf[60..62].copy_from_slice(&0u16.to_le_bytes());
        let mut loader = loader(&elf, LoaderOptions::default());

        let loaded = loader.load().unwrap();
        assert_eq!(loaded.summary.regions.len(), 1);
        assert!(loader.report().iter().any(|l| l == "Found 0 sections at 0xffffffff"));
        assert!(!loader.report().iter().any(|l| l == "strtab:"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(LoadState::Aborted.is_terminal());
        assert!(LoadState::DryRunComplete.is_terminal());
        assert!(!LoadState::ImageBuilt.is_terminal());
    }
}
