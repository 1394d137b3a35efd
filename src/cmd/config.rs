//! Configuration view and validation commands: `stagehand config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use stagehand::config::StagehandConfig;

pub fn cmd_config(config: &StagehandConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Stagehand Configuration").bold().cyan());
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No stagehand.toml found at {}", config_path.display());
                println!("Using defaults. Run 'stagehand init' to create one.");
            }
            println!();

            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Resolved paths (with env overrides):");
            println!("  database  = {}", config.db_path().display());
            println!("  workspace = {}", config.workspace_root().display());
            if let Some(dir) = config.log_dir() {
                println!("  logs      = {}", dir.display());
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No stagehand.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
