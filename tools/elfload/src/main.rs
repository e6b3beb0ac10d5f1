use std::process::ExitCode;

use clap::Parser;

use elfload_cli::cli::Cli;
use elfload_cli::{logger, output, run};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logger::init(cli.log_level) {
        eprintln!("warning: could not install logger: {e}");
    }

    match run::execute(&cli) {
        Ok(code) => code,
        Err(e) => {
            output::emit_error(cli.output, e.exit_status(), &e.to_string());
            e.exit_code()
        }
    }
}
