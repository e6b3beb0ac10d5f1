//! Diagnostic report sink.
//!
//! The loader narrates what it parses and maps as plain text lines. Where
//! those lines end up is the caller's business.

use core::fmt;

/// Receiver of human-readable report lines.
pub trait Report {
    /// Append one line.
    fn line(&mut self, args: fmt::Arguments<'_>);
}

/// Collects lines in memory.
impl Report for Vec<String> {
    fn line(&mut self, args: fmt::Arguments<'_>) {
        self.push(args.to_string());
    }
}

impl<R: Report + ?Sized> Report for &mut R {
    fn line(&mut self, args: fmt::Arguments<'_>) {
        (**self).line(args);
    }
}

/// Forwards every line to `log::info!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReport;

impl Report for LogReport {
    fn line(&mut self, args: fmt::Arguments<'_>) {
        log::info!(target: "elfload::report", "{args}");
    }
}

/// Drops every line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReport;

impl Report for NullReport {
    fn line(&mut self, _args: fmt::Arguments<'_>) {}
}

/// `report!(sink, "fmt", args..)` appends one formatted line to `sink`,
/// a `&mut` reference to a [`Report`].
#[macro_export]
macro_rules! report {
    ($sink:expr, $($arg:tt)*) => {
        $crate::report::Report::line(&mut *$sink, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_collects_lines() {
        let mut lines: Vec<String> = Vec::new();
        report!(&mut lines, "entry: {:#x}", 0x401000);
        report!(&mut lines, "done");
        assert_eq!(lines, ["entry: 0x401000", "done"]);
    }

    #[test]
    fn forwarding_through_mut_ref() {
        let mut lines: Vec<String> = Vec::new();
        {
            let mut sink = &mut lines;
            report!(&mut sink, "{}", 42);
        }
        assert_eq!(lines, ["42"]);
    }
}
