//! Project setup: `stagehand init`.

use anyhow::{Context, Result};
use std::path::Path;

use stagehand::config::{CONFIG_DIR, CONFIG_FILE, StagehandConfig, StagehandToml};
use stagehand::store::SqliteStore;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    if config_path.exists() && !force {
        println!("{} already exists at {}", CONFIG_FILE, config_path.display());
        println!("Pass --force to recreate it.");
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    StagehandToml::default().save(&config_path)?;

    let config = StagehandConfig::new(project_dir.to_path_buf())?;
    let workspace_root = config.workspace_root();
    std::fs::create_dir_all(&workspace_root)
        .with_context(|| format!("Failed to create {}", workspace_root.display()))?;
    SqliteStore::open(&config.db_path())?;

    println!(
        "{} {}",
        console::style("Initialized").green().bold(),
        config_path.display()
    );
    println!("  database:  {}", config.db_path().display());
    println!("  workspace: {}", workspace_root.display());
    println!();
    println!("You can now customize:");
    println!("  - [server] host, port, dev_mode");
    println!("  - [storage] db_path, workspace_root");
    println!("  - [stages.<name>] command, args, timeout_secs");
    println!();
    Ok(())
}
