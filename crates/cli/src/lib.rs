pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "rulepay",
    about = "Rulepay operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, and run payment rules locally.",
    after_help = "Examples:\n  rulepay doctor --json\n  rulepay resolve rule.json\n  rulepay execute payload.json\n  rulepay sign payload.json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity, and dataset readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Resolve a rule and run policy checks without moving funds")]
    Resolve {
        #[arg(help = "Path to a ruleData JSON document")]
        path: PathBuf,
        #[arg(long, default_value = "cli-dry-run", help = "Chat id used for policy lookups")]
        chat_id: String,
    },
    #[command(about = "Run an execute payload through the full pipeline against the local dataset")]
    Execute {
        #[arg(help = "Path to a {chatId, ruleData} JSON payload")]
        path: PathBuf,
    },
    #[command(about = "Print the signature header value for a payload using the configured secret")]
    Sign {
        #[arg(help = "Path to the exact request body to sign")]
        path: PathBuf,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Migrate => commands::migrate::run(),
        Command::Resolve { path, chat_id } => commands::resolve::run(&path, &chat_id),
        Command::Execute { path } => commands::execute::run(&path),
        Command::Sign { path } => commands::sign::run(&path),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
