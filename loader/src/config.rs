//! Loader configuration constants.

/// Page size used for region alignment (4 KB).
pub const PAGE_SIZE: u64 = 4096;

/// Base offset given to shared-object (PIE) inputs when none is requested.
///
/// Deterministic stand-in; no randomization.
pub const DEFAULT_PIE_BASE: u64 = 0x740_1000;

/// Text returned for names that cannot be resolved.
pub const NAME_PLACEHOLDER: &str = "???";
