pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::batch::BatchArgs;
use commands::run::RunArgs;

#[derive(Debug, Parser)]
#[command(
    name = "opsdesk",
    about = "Opsdesk operator CLI",
    long_about = "Replay customer-service scenarios through the policy, records, action and audit pipeline, with optional fault injection.",
    after_help = "Examples:\n  opsdesk scenarios\n  opsdesk run --index 0 --toggles drift\n  opsdesk batch --range 0..7 --api-error-rate 0.3 --seed 7\n  opsdesk config"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Explicit opsdesk.toml path")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run one scenario and print its audit rationale and a JSON summary")]
    Run(RunArgs),
    #[command(about = "Run a range of scenarios against one seeded store")]
    Batch(BatchArgs),
    #[command(about = "List the scenario catalog")]
    Scenarios,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match &cli.command {
        Command::Run(args) => commands::run::run(args, config_path),
        Command::Batch(args) => commands::batch::run(args, config_path),
        Command::Scenarios => commands::scenarios::run(),
        Command::Config => commands::config::run(config_path),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
