use std::path::PathBuf;

use clap::Parser;
use elfload::{LoadMode, LoaderOptions};

use crate::output::OutputFormat;

/// Load a 64-bit ELF executable into this process and jump to its entry point.
#[derive(Parser, Debug)]
#[command(name = "elfload", version, about)]
pub struct Cli {
    /// ELF64 file to load.
    #[arg(short = 'f', long)]
    pub file: PathBuf,

    /// Build the image from section headers instead of program headers.
    #[arg(short = 's', long, default_value_t = false)]
    pub load_from_sections: bool,

    /// Parse and report everything, but map nothing and never jump.
    #[arg(short = 'd', long, default_value_t = false)]
    pub dry_run: bool,

    /// Offset added to every address (e.g. "0x7401000" or "121638912").
    /// Shared objects get a fixed default when omitted.
    #[arg(long, value_parser = parse_address)]
    pub base: Option<u64>,

    /// Output format.
    #[arg(long, value_enum, default_value = "human")]
    pub output: OutputFormat,

    /// Diagnostic log level on stderr (off, error, warn, info, debug, trace).
    #[arg(long, env = "ELFLOAD_LOG", default_value = "warn")]
    pub log_level: log::LevelFilter,
}

impl Cli {
    /// Engine options selected by the flags.
    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            mode: if self.load_from_sections {
                LoadMode::Sections
            } else {
                LoadMode::Segments
            },
            dry_run: self.dry_run,
            base: self.base,
            ..LoaderOptions::default()
        }
    }
}

/// Parse an address given in hex (`0x` prefix) or decimal.
pub fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_flags() {
        let cli = Cli::try_parse_from(["elfload", "-f", "a.out", "-s", "-d"]).unwrap();
        assert_eq!(cli.file, PathBuf::from("a.out"));
        assert!(cli.load_from_sections);
        assert!(cli.dry_run);

        let options = cli.loader_options();
        assert_eq!(options.mode, LoadMode::Sections);
        assert!(options.dry_run);
        assert_eq!(options.base, None);
    }

    #[test]
    fn defaults_to_segments() {
        let cli = Cli::try_parse_from(["elfload", "--file", "a.out"]).unwrap();
        assert_eq!(cli.loader_options().mode, LoadMode::Segments);
        assert_eq!(cli.output, OutputFormat::Human);
    }

    #[test]
    fn file_is_required() {
        assert!(Cli::try_parse_from(["elfload", "--dry-run"]).is_err());
    }

    #[test]
    fn parses_base() {
        let cli = Cli::try_parse_from(["elfload", "-f", "x", "--base", "0x7401000"]).unwrap();
        assert_eq!(cli.base, Some(0x740_1000));
        assert!(Cli::try_parse_from(["elfload", "-f", "x", "--base", "0xZZ"]).is_err());
    }

    #[test]
    fn parse_address_forms() {
        assert_eq!(parse_address("0x1000"), Ok(0x1000));
        assert_eq!(parse_address("0X7fff_0000"), Ok(0x7fff_0000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("").is_err());
        assert!(parse_address("-1").is_err());
    }
}
