use std::fmt;
use std::io::{self, Write};

use elfload::{LogReport, Report};
use serde::Serialize;

/// Output format selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Single JSON summary object on stdout; report lines go to the log.
    Json,
    /// Report lines on stdout as the load progresses.
    #[default]
    Human,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// Report sink that needs a final check once the load is done.
pub trait FinishReport {
    /// Surface the first output failure, if any.
    fn finish(&mut self) -> io::Result<()>;
}

/// Report sink writing each line to stdout (or any writer).
///
/// The first write error is kept; later lines are dropped and the error is
/// returned by [`FinishReport::finish`].
#[derive(Debug)]
pub struct ConsoleReport<W = io::Stdout> {
    out: W,
    error: Option<io::Error>,
}

impl ConsoleReport {
    /// Sink writing to stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleReport<W> {
    /// Sink writing to `out`.
    pub fn new(out: W) -> Self {
        Self { out, error: None }
    }

    /// Release the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Report for ConsoleReport<W> {
    fn line(&mut self, args: fmt::Arguments<'_>) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = writeln!(self.out, "{args}") {
            self.error = Some(e);
        }
    }
}

impl<W: Write> FinishReport for ConsoleReport<W> {
    fn finish(&mut self) -> io::Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => self.out.flush(),
        }
    }
}

impl FinishReport for LogReport {
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Write a value to stdout as one JSON object.
pub fn emit_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    let json = serde_json::to_string(value)?;
    println!("{json}");
    Ok(())
}

/// Write an error to stdout (JSON mode) or stderr (human mode).
///
/// `exit_code_num` is the numeric exit status (1 or 2).
pub fn emit_error(format: OutputFormat, exit_code_num: u8, message: &str) {
    match format {
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": message,
                "exit_code": exit_code_num,
            });
            // JSON errors go to stdout so the caller always gets valid JSON on stdout.
            println!("{obj}");
        }
        OutputFormat::Human => {
            eprintln!("error: {message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_display() {
        assert_eq!(OutputFormat::Json.to_string(), "json");
        assert_eq!(OutputFormat::Human.to_string(), "human");
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn console_report_writes_lines() {
        let mut report = ConsoleReport::new(Vec::new());
        report.line(format_args!("Program entry: {:#x}", 0x401000));
        report.line(format_args!("Binary is PIE"));
        report.finish().unwrap();
        assert_eq!(report.into_inner(), b"Program entry: 0x401000\nBinary is PIE\n");
    }

    #[test]
    fn console_report_keeps_first_write_error() {
        let mut report = ConsoleReport::new(BrokenPipe);
        report.line(format_args!("first"));
        report.line(format_args!("second"));

        let err = report.finish().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        // Reported once.
        report.finish().unwrap();
    }

    #[test]
    fn output_format_default_is_human() {
        assert_eq!(OutputFormat::default(), OutputFormat::Human);
    }
}
