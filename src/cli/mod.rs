//! Command-line interface.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

pub use output::progress::{create_spinner, ProgressBarExt, SpinnerEventSink};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Conductor - staged change-request pipeline", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file; defaults to .conductor/config.yaml with overrides
    #[arg(short, long, global = true, env = "CONDUCTOR_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process a change request
    Run(commands::run::RunArgs),

    /// Configuration commands
    #[command(subcommand)]
    Config(commands::config::ConfigCommands),
}

/// Load configuration from an explicit file, or from the project hierarchy.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Print an error in the selected output mode and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = serde_json::json!({
            "success": false,
            "error": format!("{err:#}"),
        });
        eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("{} {err:#}", console::style("error:").red().bold());
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "conductor",
            "run",
            "add retries to the client",
            "--fixture",
            "replies.json",
            "--write",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.request, "add retries to the client");
                assert_eq!(args.fixture, PathBuf::from("replies.json"));
                assert!(args.write);
                assert_eq!(args.conversation, "default");
            }
            Commands::Config(_) => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = Cli::try_parse_from(["conductor", "config", "validate", "--file", "c.yaml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(commands::config::ConfigCommands::Validate { file: Some(_) })
        ));
    }
}
