//! HTTP server command: `stagehand serve`.

use anyhow::Result;

use stagehand::config::StagehandConfig;

pub async fn cmd_serve(config: StagehandConfig) -> Result<()> {
    for warning in config.validate() {
        println!("{} {}", console::style("warning:").yellow().bold(), warning);
    }
    stagehand::server::start_server(&config).await
}
