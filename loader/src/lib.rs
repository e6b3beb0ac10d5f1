//! ELF64 image loader
//!
//! Rebuilds, inside the current process, the memory image an operating
//! system would create for a 64-bit ELF executable, then optionally jumps to
//! its entry point.
//!
//! # Pipeline
//!
//! - [`elf`]: record shapes and the raw structure reader
//! - [`strtab`]: section-name lookup with a placeholder for misses
//! - [`region`]: page-aligned reservation, copy and protection
//! - [`image`]: segment- or section-driven image construction
//! - [`driver`]: the load state machine tying it all together
//!
//! # Not covered
//!
//! - Dynamic linking, relocations, `DT_NEEDED` loading
//! - 32-bit ELF
//! - argv/envp/auxv for the loaded program
//! - Address randomization (PIE inputs get a fixed base)

pub mod config;
pub mod driver;
pub mod elf;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fixture;
pub mod image;
pub mod region;
pub mod report;
pub mod strtab;

pub use driver::{Completion, EntryPoint, LoadState, LoadSummary, Loaded, Loader, LoaderOptions};
pub use error::{ErrorClass, LoadError};
pub use image::{LoadMode, MappedRegion};
pub use region::{AddressSpace, MmapAddressSpace, Permissions, Region, SimulatedAddressSpace};
pub use report::{LogReport, NullReport, Report};
