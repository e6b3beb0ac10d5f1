//! Minimal `log` backend writing to stderr.
//!
//! Lines look like `[WARN ] elfload::strtab: section-name index 9 out of range`.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Logger printing every enabled record to stderr.
#[derive(Debug)]
pub struct StderrLogger {
    level: LevelFilter,
}

impl StderrLogger {
    /// Logger passing records at or above `level`.
    pub fn new(level: LevelFilter) -> Self {
        Self { level }
    }

    /// Render one record the way it is printed.
    pub fn format(record: &Record<'_>) -> String {
        format!("[{:<5}] {}: {}", record.level(), record.target(), record.args())
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("{}", Self::format(record));
        }
    }

    fn flush(&self) {}
}

/// Install the stderr logger as the global `log` backend.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(StderrLogger::new(level)))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn level_filtering() {
        let logger = StderrLogger::new(LevelFilter::Warn);
        let warn = Metadata::builder().level(Level::Warn).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&debug));
    }

    #[test]
    fn record_format() {
        let line = StderrLogger::format(
            &Record::builder()
                .level(Level::Info)
                .target("elfload::report")
                .args(format_args!("Program entry: {:#x}", 0x401000))
                .build(),
        );
        assert_eq!(line, "[INFO ] elfload::report: Program entry: 0x401000");
    }
}
