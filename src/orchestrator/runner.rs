use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::capability::CapabilitySet;
use super::stage::Stage;
use crate::errors::RunError;
use crate::events::EventLog;
use crate::locks::{RunLockGuard, RunLocks};
use crate::run::{NewRunEvent, Run, RunEventType, RunId, WorkflowState};
use crate::store::RunRepository;
use crate::workspace::WorkspaceGate;

/// Summary recorded when a run reaches the approval gate.
pub const APPROVAL_SUMMARY: &str = "Infra artifacts ready for deploy.";

/// Executes at most one pipeline stage per `advance`.
///
/// Advances for the same run are serialized; different runs proceed
/// independently.
pub struct Orchestrator {
    runs: Arc<dyn RunRepository>,
    workspace: Arc<dyn WorkspaceGate>,
    events: EventLog,
    capabilities: CapabilitySet,
    locks: RunLocks,
}

impl Orchestrator {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        workspace: Arc<dyn WorkspaceGate>,
        events: EventLog,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            runs,
            workspace,
            events,
            capabilities,
            locks: RunLocks::new(),
        }
    }

    /// Exclusive access to a run. Anything that does read-modify-persist on
    /// a run must hold this.
    pub async fn lock(&self, run_id: RunId) -> RunLockGuard {
        self.locks.acquire(run_id).await
    }

    pub async fn advance(&self, run_id: RunId) -> Result<Run, RunError> {
        let _guard = self.lock(run_id).await;
        self.advance_locked(run_id).await
    }

    /// `advance` for callers already holding the run's lock.
    pub(crate) async fn advance_locked(&self, run_id: RunId) -> Result<Run, RunError> {
        let mut run = self.runs.get_run(run_id).await?;
        let from = run.state();
        if from.is_parked() {
            tracing::debug!(run_id = %run_id, state = %from, "Run is parked, advance is a no-op");
            return Ok(run);
        }
        let Some(next) = from.next() else {
            return Ok(run);
        };

        run.mark_step_started(Utc::now());
        self.emit(run_id, RunEventType::StepStarted, json!({ "state": from }))
            .await?;

        if let Some(stage) = Stage::for_state(from) {
            self.produce_artifact(&mut run, stage).await?;
        }

        self.emit(run_id, RunEventType::StepCompleted, json!({ "state": from }))
            .await?;

        let finished = Utc::now();
        if from == WorkflowState::Infra {
            run.request_approval(APPROVAL_SUMMARY, finished)?;
        } else {
            run.transition_to(next, finished)?;
        }

        let to = run.state();
        let event_type = if to == WorkflowState::Done {
            RunEventType::RunCompleted
        } else {
            RunEventType::StateChanged
        };
        self.emit(run_id, event_type, json!({ "state": to })).await?;

        if let Err(e) = self.runs.update_run(&run).await {
            tracing::error!(run_id = %run_id, error = %e, "Failed to persist run after stage");
            return Err(e);
        }
        tracing::info!(run_id = %run_id, from = %from, to = %to, "Run advanced");
        Ok(run)
    }

    async fn produce_artifact(&self, run: &mut Run, stage: Stage) -> Result<(), RunError> {
        let run_id = run.id();
        let path = stage.artifact_path();

        if self.workspace.exists(run_id, path).await? {
            tracing::debug!(
                run_id = %run_id,
                stage = %stage,
                path,
                "Artifact already present, skipping capability"
            );
            // The file may predate the last persisted run (crash after write).
            let location = self.workspace.locate(run_id, path)?.display().to_string();
            run.record_artifact(stage.artifact_type(), &location, Utc::now(), stage.state());
            return Ok(());
        }

        let capability = self
            .capabilities
            .for_stage(stage)
            .ok_or_else(|| RunError::CapabilityFailure {
                stage: stage.state(),
                source: anyhow::anyhow!("No capability configured for stage {}", stage),
            })?;

        let content = match capability.execute(run_id, run.prompt()).await {
            Ok(content) => content,
            Err(source) => {
                let error = format!("{:#}", source);
                tracing::warn!(run_id = %run_id, stage = %stage, error = %error, "Stage capability failed");
                if stage.is_validation() {
                    let payload = json!({ "state": stage.state(), "error": error });
                    if let Err(e) = self.emit(run_id, RunEventType::ValidationFailed, payload).await {
                        tracing::error!(run_id = %run_id, error = %e, "Failed to record validation failure");
                    }
                }
                return Err(RunError::CapabilityFailure {
                    stage: stage.state(),
                    source,
                });
            }
        };

        let location = self.workspace.write_text(run_id, path, &content).await?;
        let location = location.display().to_string();
        run.record_artifact(stage.artifact_type(), &location, Utc::now(), stage.state());
        self.emit(
            run_id,
            RunEventType::ArtifactWritten,
            json!({ "path": location, "step": stage.state() }),
        )
        .await?;
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::capability::StageCapability;
    use crate::store::SqliteStore;
    use crate::workspace::FsWorkspace;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageCapability for Counting {
        async fn execute(&self, _run_id: RunId, _prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok("{}".to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl StageCapability for Failing {
        async fn execute(&self, _run_id: RunId, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("generator unavailable")
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<SqliteStore>,
        workspace: Arc<FsWorkspace>,
        events: EventLog,
        orchestrator: Arc<Orchestrator>,
    }

    async fn harness(capabilities: CapabilitySet) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let workspace = Arc::new(FsWorkspace::new(dir.path()));
        let events = EventLog::new(store.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            workspace.clone(),
            events.clone(),
            capabilities,
        ));
        Harness {
            _dir: dir,
            store,
            workspace,
            events,
            orchestrator,
        }
    }

    async fn insert_run_in(h: &Harness, state: WorkflowState) -> RunId {
        let mut run = Run::start(Utc::now(), "build X", None);
        let mut current = WorkflowState::Init;
        while current != state {
            let next = current.next().unwrap();
            if next == WorkflowState::WaitingForApproval {
                run.request_approval(APPROVAL_SUMMARY, Utc::now()).unwrap();
            } else {
                run.transition_to(next, Utc::now()).unwrap();
            }
            current = next;
        }
        h.store.insert_run(&run).await.unwrap();
        run.id()
    }

    async fn event_types(h: &Harness, run_id: RunId) -> Vec<RunEventType> {
        h.events
            .history(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_init_is_pass_through() {
        let h = harness(CapabilitySet::echo()).await;
        let id = insert_run_in(&h, WorkflowState::Init).await;

        let run = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(run.state(), WorkflowState::Spec);
        assert!(run.artifacts().is_empty());
        assert_eq!(
            event_types(&h, id).await,
            vec![
                RunEventType::StepStarted,
                RunEventType::StepCompleted,
                RunEventType::StateChanged
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_writes_artifact_and_transitions() {
        let h = harness(CapabilitySet::echo()).await;
        let id = insert_run_in(&h, WorkflowState::Spec).await;

        let run = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(run.state(), WorkflowState::Plan);
        assert_eq!(run.artifacts().len(), 1);
        assert_eq!(run.artifacts()[0].artifact_type, "spec.json");
        assert_eq!(run.artifacts()[0].step, WorkflowState::Spec);
        assert!(run.step_duration(WorkflowState::Spec).is_some());
        assert!(run.current_step_started_at().is_none());
        assert!(h.workspace.exists(id, "spec.json").await.unwrap());

        let persisted = h.store.get_run(id).await.unwrap();
        assert_eq!(persisted.state(), WorkflowState::Plan);
        assert_eq!(persisted.artifacts().len(), 1);

        assert_eq!(
            event_types(&h, id).await,
            vec![
                RunEventType::StepStarted,
                RunEventType::ArtifactWritten,
                RunEventType::StepCompleted,
                RunEventType::StateChanged
            ]
        );
    }

    #[tokio::test]
    async fn test_existing_artifact_skips_capability() {
        let calls = Arc::new(AtomicUsize::new(0));
        let caps = CapabilitySet::echo().with(
            Stage::Plan,
            Arc::new(Counting {
                calls: calls.clone(),
            }),
        );
        let h = harness(caps).await;
        let id = insert_run_in(&h, WorkflowState::Plan).await;
        h.workspace.write_text(id, "plan.json", "{}").await.unwrap();

        let run = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.state(), WorkflowState::AppCode);
        assert_eq!(run.artifacts().len(), 1);
        assert_eq!(run.artifacts()[0].artifact_type, "plan.json");
        assert!(!event_types(&h, id).await.contains(&RunEventType::ArtifactWritten));
    }

    #[tokio::test]
    async fn test_recovery_after_crash_restores_artifact_ref() {
        let calls = Arc::new(AtomicUsize::new(0));
        let caps = CapabilitySet::echo().with(
            Stage::Spec,
            Arc::new(Counting {
                calls: calls.clone(),
            }),
        );
        let h = harness(caps).await;
        let id = insert_run_in(&h, WorkflowState::Spec).await;
        // The earlier advance wrote the file, then died before saving the run.
        let written = h.workspace.write_text(id, "spec.json", "{}").await.unwrap();

        let run = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.state(), WorkflowState::Plan);
        assert_eq!(run.artifacts().len(), 1);
        assert_eq!(run.artifacts()[0].path, written.display().to_string());
        assert_eq!(run.artifacts()[0].step, WorkflowState::Spec);

        let persisted = h.store.get_run(id).await.unwrap();
        assert_eq!(persisted.artifacts().len(), 1);
        assert!(persisted.has_artifact(&written.display().to_string()));
    }

    #[tokio::test]
    async fn test_skip_does_not_duplicate_existing_ref() {
        let h = harness(CapabilitySet::echo()).await;
        let id = insert_run_in(&h, WorkflowState::Spec).await;
        let written = h.workspace.write_text(id, "spec.json", "{}").await.unwrap();

        // Persist a run that already carries the ref but is still in Spec.
        let mut run = h.store.get_run(id).await.unwrap();
        run.record_artifact("spec.json", &written.display().to_string(), Utc::now(), WorkflowState::Spec);
        h.store.update_run(&run).await.unwrap();

        let run = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(run.state(), WorkflowState::Plan);
        assert_eq!(run.artifacts().len(), 1);
        assert_eq!(h.store.get_run(id).await.unwrap().artifacts().len(), 1);
    }

    #[tokio::test]
    async fn test_infra_parks_at_approval_gate() {
        let h = harness(CapabilitySet::echo()).await;
        let id = insert_run_in(&h, WorkflowState::Infra).await;

        let run = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(run.state(), WorkflowState::WaitingForApproval);
        assert_eq!(run.approval_summary(), Some(APPROVAL_SUMMARY));

        let again = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(again.state(), WorkflowState::WaitingForApproval);
    }

    #[tokio::test]
    async fn test_deploy_completes_run() {
        let h = harness(CapabilitySet::echo()).await;
        let id = insert_run_in(&h, WorkflowState::Deploy).await;

        let run = h.orchestrator.advance(id).await.unwrap();
        assert_eq!(run.state(), WorkflowState::Done);
        assert!(run.has_artifact(&h.workspace.resolve(id, "deploy-report.json").unwrap().display().to_string()));
        assert_eq!(event_types(&h, id).await.last(), Some(&RunEventType::RunCompleted));
    }

    #[tokio::test]
    async fn test_parked_states_are_noops() {
        let h = harness(CapabilitySet::echo()).await;
        for state in [WorkflowState::WaitingForApproval, WorkflowState::Done] {
            let id = insert_run_in(&h, state).await;
            let before = h.store.get_run(id).await.unwrap();
            let after = h.orchestrator.advance(id).await.unwrap();
            assert_eq!(after.state(), state);
            assert_eq!(after.updated_at(), before.updated_at());
            assert!(event_types(&h, id).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let h = harness(CapabilitySet::echo()).await;
        let err = h.orchestrator.advance(RunId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_capability_failure_leaves_run_retryable() {
        let h = harness(CapabilitySet::echo().with(Stage::AppCode, Arc::new(Failing))).await;
        let id = insert_run_in(&h, WorkflowState::AppCode).await;

        let err = h.orchestrator.advance(id).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::CapabilityFailure { stage: WorkflowState::AppCode, .. }
        ));
        let persisted = h.store.get_run(id).await.unwrap();
        assert_eq!(persisted.state(), WorkflowState::AppCode);
        assert!(persisted.current_step_started_at().is_none());
        assert!(!h.workspace.exists(id, "app/README.md").await.unwrap());
        assert!(!event_types(&h, id).await.contains(&RunEventType::ValidationFailed));
    }

    #[tokio::test]
    async fn test_validation_failure_is_recorded() {
        let h = harness(CapabilitySet::echo().with(Stage::Security, Arc::new(Failing))).await;
        let id = insert_run_in(&h, WorkflowState::Security).await;

        assert!(h.orchestrator.advance(id).await.is_err());
        let history = h.events.history(id).await.unwrap();
        let failed = history
            .iter()
            .find(|e| e.event_type == RunEventType::ValidationFailed)
            .expect("validation failure event");
        assert_eq!(failed.payload["state"], "security");
        assert!(failed.payload["error"].as_str().unwrap().contains("generator unavailable"));
    }

    #[tokio::test]
    async fn test_concurrent_advances_invoke_capability_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let caps = CapabilitySet::echo().with(
            Stage::Spec,
            Arc::new(Counting {
                calls: calls.clone(),
            }),
        );
        let h = harness(caps).await;
        let id = insert_run_in(&h, WorkflowState::Spec).await;

        let a = tokio::spawn({
            let o = h.orchestrator.clone();
            async move { o.advance(id).await }
        });
        let b = tokio::spawn({
            let o = h.orchestrator.clone();
            async move { o.advance(id).await }
        });
        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // One advance ran Spec, the other ran Plan.
        let mut states = vec![ra.state(), rb.state()];
        states.sort_by_key(|s| s.as_str());
        assert_eq!(states, vec![WorkflowState::AppCode, WorkflowState::Plan]);
        let final_run = h.store.get_run(id).await.unwrap();
        assert_eq!(final_run.state(), WorkflowState::AppCode);
        assert_eq!(final_run.artifacts().len(), 2);
    }
}
