use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use stagehand::config::StagehandConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Drive build runs through gated generation and validation stages")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "STAGEHAND_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .stagehand/ with a default stagehand.toml
    Init {
        /// Overwrite an existing stagehand.toml
        #[arg(long)]
        force: bool,
    },
    /// Serve the HTTP API and event stream
    Serve {
        /// Port to serve on (overrides stagehand.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides stagehand.toml)
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive for local frontends)
        #[arg(long)]
        dev: bool,
    },
    /// Start a new run
    Start {
        /// What the run should build
        prompt: String,

        #[arg(long)]
        project_name: Option<String>,
    },
    /// Execute the current step of a run and move it forward
    Advance { id: String },
    /// Approve a run waiting at the deploy gate
    Approve { id: String },
    /// Execute the deploy step of an approved run
    Deploy { id: String },
    /// Reject a run
    Reject {
        id: String,

        #[arg(short, long)]
        reason: String,
    },
    /// Abort a run as a system failure
    Fail {
        id: String,

        #[arg(short, long)]
        reason: String,
    },
    /// Count a retry and advance again
    Retry { id: String },
    /// Show a run with its recent events
    Show {
        id: String,

        /// Print the raw JSON document
        #[arg(long)]
        json: bool,
    },
    /// Print the latest events of a run
    Events {
        id: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Init { force } = &cli.command {
        return cmd::cmd_init(&project_dir, *force);
    }

    let config = StagehandConfig::new(project_dir)?;
    let _log_guard = stagehand::logging::init(
        &config.toml.logging,
        config.log_dir().as_deref(),
        cli.verbose,
    )?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config.with_server_overrides(host, port, dev)).await?
        }
        Commands::Start {
            prompt,
            project_name,
        } => cmd::cmd_start(&config, &prompt, project_name.as_deref()).await?,
        Commands::Advance { id } => cmd::cmd_advance(&config, &id).await?,
        Commands::Approve { id } => cmd::cmd_approve(&config, &id).await?,
        Commands::Deploy { id } => cmd::cmd_deploy(&config, &id).await?,
        Commands::Reject { id, reason } => cmd::cmd_reject(&config, &id, &reason).await?,
        Commands::Fail { id, reason } => cmd::cmd_fail(&config, &id, &reason).await?,
        Commands::Retry { id } => cmd::cmd_retry(&config, &id).await?,
        Commands::Show { id, json } => cmd::cmd_show(&config, &id, json).await?,
        Commands::Events { id, limit } => cmd::cmd_events(&config, &id, limit).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
