use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use serde_json::json;

use super::capability::CapabilitySet;
use super::runner::Orchestrator;
use crate::config::StagehandConfig;
use crate::errors::RunError;
use crate::events::EventLog;
use crate::run::{NewRunEvent, Run, RunEvent, RunEventType, RunId};
use crate::store::{EventStore, RunRepository, SqliteStore};
use crate::workspace::{FsWorkspace, WorkspaceGate};

pub const MAX_PROMPT_CHARS: usize = 4000;
pub const MAX_PROJECT_NAME_CHARS: usize = 200;
pub const MAX_REASON_CHARS: usize = 500;

/// A run plus its most recent events, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetails {
    #[serde(flatten)]
    pub run: Run,
    pub recent_events: Vec<RunEvent>,
}

/// Command-level operations on runs.
///
/// Every operation that reads, mutates and persists a run holds that run's
/// lock, so approvals and rejections never interleave with an `advance`.
#[derive(Clone)]
pub struct RunService {
    runs: Arc<dyn RunRepository>,
    events: EventLog,
    orchestrator: Arc<Orchestrator>,
    recent_limit: usize,
}

impl RunService {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        event_store: Arc<dyn EventStore>,
        workspace: Arc<dyn WorkspaceGate>,
        capabilities: CapabilitySet,
    ) -> Self {
        let events = EventLog::new(event_store);
        let orchestrator = Arc::new(Orchestrator::new(
            runs.clone(),
            workspace,
            events.clone(),
            capabilities,
        ));
        Self {
            runs,
            events,
            orchestrator,
            recent_limit: 10,
        }
    }

    /// Wire up SQLite storage, the filesystem workspace and configured
    /// capabilities for a project.
    pub fn from_config(config: &StagehandConfig) -> anyhow::Result<Self> {
        let db_path = config.db_path();
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
        );
        let workspace = Arc::new(FsWorkspace::new(config.workspace_root()));
        let capabilities = CapabilitySet::from_config(&config.toml, &config.project_dir);
        Ok(Self::new(store.clone(), store, workspace, capabilities)
            .with_recent_limit(config.toml.events.recent_limit))
    }

    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub async fn start_run(&self, prompt: &str, project_name: Option<&str>) -> Result<Run, RunError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(RunError::InvalidInput("prompt is required".to_string()));
        }
        check_len("prompt", prompt, MAX_PROMPT_CHARS)?;
        let project_name = project_name.map(str::trim).filter(|n| !n.is_empty());
        if let Some(name) = project_name {
            check_len("project name", name, MAX_PROJECT_NAME_CHARS)?;
        }

        let run = Run::start(Utc::now(), prompt, project_name);
        self.runs.insert_run(&run).await?;
        self.emit(run.id(), RunEventType::StateChanged, json!({ "state": run.state() }))
            .await?;
        tracing::info!(run_id = %run.id(), project = ?project_name, "Run started");
        Ok(run)
    }

    pub async fn advance_run(&self, run_id: RunId) -> Result<Run, RunError> {
        self.orchestrator.advance(run_id).await
    }

    /// Same as [`RunService::advance_run`]; deploy is just the last guarded stage.
    pub async fn deploy_run(&self, run_id: RunId) -> Result<Run, RunError> {
        self.advance_run(run_id).await
    }

    pub async fn approve_run(&self, run_id: RunId) -> Result<Run, RunError> {
        let _guard = self.orchestrator.lock(run_id).await;
        let mut run = self.runs.get_run(run_id).await?;
        run.approve(Utc::now())?;
        self.runs.update_run(&run).await?;
        self.emit(run_id, RunEventType::StateChanged, json!({ "state": run.state() }))
            .await?;
        tracing::info!(run_id = %run_id, "Run approved");
        Ok(run)
    }

    /// Human rejection. Succeeds from any state, including terminal ones.
    pub async fn reject_run(&self, run_id: RunId, reason: &str) -> Result<Run, RunError> {
        let reason = validate_reason(reason)?;
        let _guard = self.orchestrator.lock(run_id).await;
        let mut run = self.runs.get_run(run_id).await?;
        run.reject(reason, Utc::now());
        self.persist_failure(run, reason).await
    }

    /// Operator or system abort.
    pub async fn fail_run(&self, run_id: RunId, reason: &str) -> Result<Run, RunError> {
        let reason = validate_reason(reason)?;
        let _guard = self.orchestrator.lock(run_id).await;
        let mut run = self.runs.get_run(run_id).await?;
        run.fail(reason, Utc::now());
        self.persist_failure(run, reason).await
    }

    /// Count a retry, then advance. The engine never retries on its own.
    pub async fn retry_run(&self, run_id: RunId) -> Result<Run, RunError> {
        let _guard = self.orchestrator.lock(run_id).await;
        let mut run = self.runs.get_run(run_id).await?;
        run.increment_retry(Utc::now());
        self.runs.update_run(&run).await?;
        tracing::info!(run_id = %run_id, retry_count = run.retry_count(), "Retrying run");
        self.orchestrator.advance_locked(run_id).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<RunDetails, RunError> {
        let run = self.runs.get_run(run_id).await?;
        let recent_events = self.events.latest(run_id, self.recent_limit).await?;
        Ok(RunDetails { run, recent_events })
    }

    pub async fn latest_events(&self, run_id: RunId, limit: usize) -> Result<Vec<RunEvent>, RunError> {
        self.runs.get_run(run_id).await?;
        self.events.latest(run_id, limit).await
    }

    /// Replay-then-tail stream of a run's events. Fails up front if the run
    /// does not exist.
    pub async fn stream_events(
        &self,
        run_id: RunId,
    ) -> Result<impl Stream<Item = Result<RunEvent, RunError>> + Send + 'static + use<>, RunError> {
        self.runs.get_run(run_id).await?;
        Ok(self.events.subscribe(run_id))
    }

    async fn persist_failure(&self, run: Run, reason: &str) -> Result<Run, RunError> {
        let run_id = run.id();
        self.runs.update_run(&run).await?;
        let kind = run.failure_kind().map(|k| k.as_str());
        self.emit(
            run_id,
            RunEventType::RunFailed,
            json!({ "state": run.state(), "reason": reason, "kind": kind }),
        )
        .await?;
        tracing::info!(run_id = %run_id, kind = ?kind, reason, "Run failed");
        Ok(run)
    }

    async fn emit(
        &self,
        run_id: RunId,
        event_type: RunEventType,
        payload: serde_json::Value,
    ) -> Result<(), RunError> {
        self.events
            .append(NewRunEvent::new(run_id, event_type, payload))
            .await
            .map(|_| ())
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), RunError> {
    if value.chars().count() > max {
        return Err(RunError::InvalidInput(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

fn validate_reason(reason: &str) -> Result<&str, RunError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(RunError::InvalidInput("reason is required".to_string()));
    }
    check_len("reason", reason, MAX_REASON_CHARS)?;
    Ok(reason)
}
