//! Conductor CLI entry point.

use clap::Parser;

use conductor::cli::{commands, handle_error, load_config, Cli, Commands};
use conductor::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = load_config(cli.config.as_deref());
    let log_config = loaded
        .as_ref()
        .map(|config| LogConfig::from(&config.logging))
        .unwrap_or_default();
    let _logger = match LoggerImpl::init(&log_config) {
        Ok(logger) => Some(logger),
        Err(err) => {
            eprintln!("warning: logging disabled: {err:#}");
            None
        }
    };

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, loaded, cli.json).await,
        Commands::Config(command) => commands::config::execute(command, loaded, cli.json).await,
    };

    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
