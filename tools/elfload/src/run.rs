//! Command execution: read the input, drive a load, hand over control.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use elfload::{AddressSpace, Completion, LogReport, Loader, LoaderOptions, MmapAddressSpace, Report};

use crate::cli::Cli;
use crate::error::ElfloadError;
use crate::output::{self, ConsoleReport, FinishReport, OutputFormat};

/// Read the whole input file.
pub fn read_input(path: &Path) -> Result<Vec<u8>, ElfloadError> {
    std::fs::read(path).map_err(|source| ElfloadError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Run the command described by `cli` in this process.
///
/// Returns only for dry runs and failures; a successful real load jumps to
/// the program's entry point.
pub fn execute(cli: &Cli) -> Result<ExitCode, ElfloadError> {
    let file = read_input(&cli.file)?;
    let options = cli.loader_options();
    log::debug!("loading {} ({} bytes) with {options:?}", cli.file.display(), file.len());

    match cli.output {
        OutputFormat::Human => drive(&file, options, MmapAddressSpace::new(), ConsoleReport::stdout(), cli.output),
        OutputFormat::Json => drive(&file, options, MmapAddressSpace::new(), LogReport, cli.output),
    }
}

fn drive<A: AddressSpace, R: Report + FinishReport>(
    file: &[u8],
    options: LoaderOptions,
    space: A,
    report: R,
    format: OutputFormat,
) -> Result<ExitCode, ElfloadError> {
    let mut loader = Loader::new(file, options, space, report);
    let loaded = loader.load()?;
    loader.report_mut().finish()?;

    if format == OutputFormat::Json {
        output::emit_json(&loaded.summary)?;
    }

    match loaded.completion {
        Completion::DryRun => Ok(ExitCode::SUCCESS),
        Completion::Transfer(entry) => {
            io::stdout().flush()?;
            io::stderr().flush()?;
            // SAFETY: `entry` comes from this loader's non-dry-run completion;
            // the image is mapped with its final protections.
            unsafe { loader.transfer(entry) }
        }
    }
}
