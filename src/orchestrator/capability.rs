use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::stage::Stage;
use crate::config::{StageCommandConfig, StagehandToml};
use crate::run::RunId;

/// Produces the content for one stage's artifact.
///
/// Content is opaque: whatever is returned is written verbatim to the
/// stage's artifact path.
#[async_trait]
pub trait StageCapability: Send + Sync {
    async fn execute(&self, run_id: RunId, prompt: &str) -> Result<String>;
}

/// Placeholder capability used when no command is configured for a stage.
/// Returns a small JSON envelope describing the request.
#[derive(Debug, Clone)]
pub struct EchoCapability {
    stage: Stage,
}

impl EchoCapability {
    pub fn new(stage: Stage) -> Self {
        Self { stage }
    }
}

#[async_trait]
impl StageCapability for EchoCapability {
    async fn execute(&self, run_id: RunId, prompt: &str) -> Result<String> {
        let envelope = serde_json::json!({
            "run_id": run_id,
            "stage": self.stage.name(),
            "prompt": prompt,
            "generated_at": Utc::now(),
        });
        serde_json::to_string_pretty(&envelope).context("Failed to serialize stage output")
    }
}

/// Runs an external program for a stage.
///
/// The prompt is written to stdin and stdout becomes the artifact.
/// `STAGEHAND_RUN_ID` and `STAGEHAND_STAGE` are set in the child's
/// environment. A non-zero exit or exceeding the timeout is a failure.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    stage: Stage,
    command: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandCapability {
    pub fn new(stage: Stage, config: &StageCommandConfig) -> Self {
        Self {
            stage,
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(&self, run_id: RunId, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("STAGEHAND_RUN_ID", run_id.to_string())
            .env("STAGEHAND_STAGE", self.stage.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.command))?;

        // Write prompt to stdin and close it. Commands that ignore stdin may
        // exit before reading it; that surfaces as a broken pipe, not a failure.
        if let Some(mut stdin) = child.stdin.take() {
            let written = match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e).context("Failed to write prompt to stdin"),
            }
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("'{}' produced non-UTF-8 output", self.command))
    }
}

#[async_trait]
impl StageCapability for CommandCapability {
    async fn execute(&self, run_id: RunId, prompt: &str) -> Result<String> {
        tracing::debug!(
            run_id = %run_id,
            stage = %self.stage,
            command = %self.command,
            "Spawning stage command"
        );
        // Timing out drops the future, and kill_on_drop reaps the child.
        tokio::time::timeout(self.timeout, self.run(run_id, prompt))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "'{}' timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                )
            })?
    }
}

/// One capability per stage.
#[derive(Clone)]
pub struct CapabilitySet {
    capabilities: HashMap<Stage, Arc<dyn StageCapability>>,
}

impl CapabilitySet {
    /// Echo capabilities for every stage.
    pub fn echo() -> Self {
        let capabilities = Stage::ALL
            .into_iter()
            .map(|stage| (stage, Arc::new(EchoCapability::new(stage)) as Arc<dyn StageCapability>))
            .collect();
        Self { capabilities }
    }

    /// Command capabilities where `[stages.<name>]` is configured, echo elsewhere.
    /// Commands run with `working_dir` as their current directory.
    pub fn from_config(toml: &StagehandToml, working_dir: &std::path::Path) -> Self {
        let mut set = Self::echo();
        for stage in Stage::ALL {
            if let Some(cmd) = toml.stage_command(stage) {
                set = set.with(
                    stage,
                    Arc::new(CommandCapability::new(stage, cmd).with_working_dir(working_dir)),
                );
            }
        }
        set
    }

    pub fn with(mut self, stage: Stage, capability: Arc<dyn StageCapability>) -> Self {
        self.capabilities.insert(stage, capability);
        self
    }

    pub fn for_stage(&self, stage: Stage) -> Option<Arc<dyn StageCapability>> {
        self.capabilities.get(&stage).cloned()
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::echo()
    }
}
