use clap::Parser;
use std::process::ExitCode;

use resqued::cli::args::{Cli, Commands};
use resqued::cli::{listener, quit_wait, start};
use resqued::error::exit_codes;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> resqued::Result<()> {
    match cli.command {
        Commands::Start {
            config,
            pidfile,
            exec_on_hup,
            fast_exit,
            status_pipe,
            log_file,
        } => start::start(
            config,
            pidfile,
            exec_on_hup,
            fast_exit,
            status_pipe,
            log_file,
        ),

        Commands::Listener => listener::listener(),

        Commands::QuitAndWait {
            pidfile,
            grace_period,
        } => quit_wait::quit_and_wait(&pidfile, grace_period),
    }
}
