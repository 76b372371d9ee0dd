// reconmatch CLI - config-driven fuzzy reconciliation over CSV sources

mod exit_codes;
mod recon;

use std::process::ExitCode;

use clap::Parser;

use exit_codes::{recon_exit_code, EXIT_SUCCESS, EXIT_USAGE};
use reconmatch::ReconError;

#[derive(Parser)]
#[command(name = "reconmatch")]
#[command(about = "Fuzzy multi-source reconciliation (bulk runs, candidate search, config checks)")]
#[command(version)]
struct Cli {
    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: recon::ReconCommands,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match recon::cmd_recon(cli.command) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    pub fn args(msg: impl Into<String>) -> Self {
        Self::new(EXIT_USAGE, msg)
    }

    /// Create error from an engine error with the registered exit code.
    pub fn recon(err: ReconError) -> Self {
        let code = recon_exit_code(&err);
        let hint = match &err {
            ReconError::Configuration(msg) if msg.contains("sum") => {
                Some("weights for amount, date and every comparator must add up to 1.0".to_string())
            }
            ReconError::MissingColumn { source, .. } => {
                Some(format!("check [sources.{source}.columns] against the CSV header"))
            }
            ReconError::AlreadyLinked { .. } => {
                Some("unlink the existing match first; links are never replaced implicitly".to_string())
            }
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
