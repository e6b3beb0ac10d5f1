//! Loader error taxonomy.
//!
//! Errors fall into two classes:
//! - **Format errors**: the input is not an ELF64 image we can read
//!   (bad magic, wrong class, truncated tables, impossible extents).
//! - **Resource errors**: the process address space refused a reservation,
//!   a write or a protection change.
//!
//! Both are fatal for the load in progress. Name lookups that miss the
//! string table are not errors at all; see [`crate::strtab`].

use std::io;
use std::process::ExitCode;

/// Error class of a [`LoadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unsupported input.
    Format,
    /// Address-space operation failed.
    Resource,
}

/// All errors produced while building an image.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    // ── Format errors ────────────────────────────────────────────────

    #[error("bad magic {found:02x?}, expected 7f 45 4c 46")]
    BadMagic { found: Vec<u8> },

    #[error("unsupported ELF class {class} (only ELFCLASS64 is supported)")]
    UnsupportedClass { class: u8 },

    #[error("{what} at offset {offset:#x} (+{len} bytes) runs past end of file ({file_len} bytes)")]
    Truncated {
        what: &'static str,
        offset: u64,
        len: u64,
        file_len: usize,
    },

    #[error("loadable segment {index}: memory size {memsz:#x} is smaller than file size {filesz:#x}")]
    SegmentSizeMismatch { index: usize, filesz: u64, memsz: u64 },

    #[error("{label}: file extent {offset:#x}+{len:#x} lies outside the file ({file_len} bytes)")]
    ExtentOutOfBounds {
        label: String,
        offset: u64,
        len: u64,
        file_len: usize,
    },

    #[error("address arithmetic overflows for {label} ({addr:#x} + {len:#x})")]
    AddressOverflow { label: String, addr: u64, len: u64 },

    // ── Resource errors ──────────────────────────────────────────────

    #[error("failed to reserve [{start:#x}, +{len:#x}): {source}")]
    Reserve {
        start: u64,
        len: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {len:#x} bytes at {addr:#x}: {reason}")]
    Write { addr: u64, len: u64, reason: String },

    #[error("failed to change protection of [{start:#x}, +{len:#x}): {source}")]
    Protect {
        start: u64,
        len: u64,
        #[source]
        source: io::Error,
    },
}

impl LoadError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BadMagic { .. }
            | Self::UnsupportedClass { .. }
            | Self::Truncated { .. }
            | Self::SegmentSizeMismatch { .. }
            | Self::ExtentOutOfBounds { .. }
            | Self::AddressOverflow { .. } => ErrorClass::Format,

            Self::Reserve { .. } | Self::Write { .. } | Self::Protect { .. } => {
                ErrorClass::Resource
            }
        }
    }

    /// Numeric process exit status for this error.
    ///
    /// - `1`: format error
    /// - `2`: resource error
    pub fn exit_status(&self) -> u8 {
        match self.class() {
            ErrorClass::Format => 1,
            ErrorClass::Resource => 2,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}
