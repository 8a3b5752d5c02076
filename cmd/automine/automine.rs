use std::process::ExitCode;

use automine::cli::{CLI, Subcommand};
use automine::initializers;
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let CLI { opts, command } = CLI::parse();
    let _log_guard = initializers::init_tracing(&opts);

    let result = match command {
        None | Some(Subcommand::Start) => initializers::run_agent(opts).await,
        Some(Subcommand::Recall { quarry, clear }) => {
            initializers::run_recall(&opts, quarry, clear).await
        }
        Some(Subcommand::Configure) => initializers::run_configure(&opts).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "exiting");
            ExitCode::from(err.exit_code())
        }
    }
}
