//! Implementation of the `conductor config` commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Validate configuration
    Validate {
        /// File to validate instead of the effective configuration
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
pub struct ConfigShowOutput {
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_else(|e| format!("<unrenderable: {e}>"))
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigValidateOutput {
    pub valid: bool,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutput for ConfigValidateOutput {
    fn to_human(&self) -> String {
        match &self.error {
            None => format!("{} {} is valid", console::style("✓").green(), self.source),
            Some(error) => format!("{} {}: {error}", console::style("✗").red(), self.source),
        }
    }
}

/// `loaded` is the effective configuration resolved by the caller.
pub async fn execute(command: ConfigCommands, loaded: Result<Config>, json_mode: bool) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = loaded.context("Failed to load configuration")?;
            output(&ConfigShowOutput { config }, json_mode);
            Ok(())
        }
        ConfigCommands::Validate { file } => {
            let (source, result) = match file {
                Some(path) => (path.display().to_string(), ConfigLoader::load_from_file(&path)),
                None => ("effective configuration".to_string(), loaded),
            };
            let report = ConfigValidateOutput {
                valid: result.is_ok(),
                source,
                error: result.as_ref().err().map(|e| format!("{e:#}")),
            };
            output(&report, json_mode);
            match result {
                Ok(_) => Ok(()),
                Err(err) => Err(err.context("Configuration is invalid")),
            }
        }
    }
}
