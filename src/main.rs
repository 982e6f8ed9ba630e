use std::process::ExitCode;

use clap::Parser;
use console::style;

use eventlog_ops::cli::Cli;
use eventlog_ops::error::OpsError;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = eventlog_ops::logging::init(cli.debug, cli.debug_log.as_deref()) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        return ExitCode::FAILURE;
    }

    match eventlog_ops::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if matches!(err.downcast_ref::<OpsError>(), Some(OpsError::RunInterrupted)) => {
            eprintln!("{} {err}", style("Interrupted:").yellow().bold());
            ExitCode::from(eventlog_ops::EXIT_INTERRUPTED)
        }
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::FAILURE
        }
    }
}
